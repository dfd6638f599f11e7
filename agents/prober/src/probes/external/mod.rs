//! External probe engine.
//!
//! Probes a set of targets by running an external command. In `once` mode
//! the command is executed per target per cycle; in `server` mode a single
//! long-lived process answers framed probe requests over stdin/stdout (see
//! [`protocol`]) and is restarted on the next cycle if it dies.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::{bail, eyre, Context, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, instrument::Instrumented, warn, Instrument};

use fleetprober_base::CoreMetrics;
use fleetprober_core::metrics::payload::{Parser, PayloadParserOpts};
use fleetprober_core::metrics::{EventMetrics, Kind, MapValue, Value};
use fleetprober_core::template::substitute_labels;
use fleetprober_core::validators::{run_validators, validation_failure_map};
use fleetprober_core::{Endpoint, ProbeOptions};

pub mod protocol;

use protocol::{FrameError, ProbeReply, ProbeRequest, RequestOption};

/// Label tokens the engine knows how to substitute.
static SUBST_LABEL_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"@(target|address|port|probe|target\.label\.[^@]+)@").expect("static regex")
});

/// Pacing between request sends in server mode. Gives the probe process a
/// chance to dequeue and keeps the pipe from filling; note the cycle timeout
/// covers all targets in aggregate, so this must stay small relative to
/// timeout / target count.
const TIME_BETWEEN_REQUESTS: Duration = Duration::from_micros(10);

/// How the external command is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Spawn the command once per target per cycle
    Once,
    /// Keep one long-lived probe server process
    Server,
}

/// One probe option forwarded to server-mode processes, value subject to
/// `@label@` substitution.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionPair {
    /// Option name
    pub name: String,
    /// Option value
    pub value: String,
}

/// External probe configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalProbeConf {
    /// Command line, shell-style split
    pub command: String,
    /// Execution mode
    pub mode: Mode,
    /// Extra environment for the probe process; empty values default to "1"
    #[serde(default)]
    pub env_var: BTreeMap<String, String>,
    /// Options passed in server-mode requests
    #[serde(default)]
    pub options: Vec<OptionPair>,
    /// Parse the process output (or reply payload) into metrics
    #[serde(default)]
    pub output_as_metrics: bool,
    /// Payload parser configuration, when `output_as_metrics` is on
    #[serde(default)]
    pub output_metrics_options: PayloadParserOpts,
}

/// Per-target accumulator over the probe's lifetime.
#[derive(Debug, Clone)]
struct ProbeResult {
    total: i64,
    success: i64,
    latency: Value,
    validation_failure: Option<MapValue>,
}

/// One probe outcome, passed from the cycle runners to result processing.
#[derive(Debug)]
struct ProbeStatus {
    target: Endpoint,
    success: bool,
    latency: Duration,
    payload: String,
}

/// What the sender recorded about an outstanding request.
#[derive(Debug)]
struct RequestInfo {
    target: Endpoint,
    sent_at: Instant,
}

/// Handle to a running server-mode probe process.
struct ServerProcess {
    stdin: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    reply_rx: mpsc::Receiver<ProbeReply>,
    running: Arc<AtomicBool>,
}

/// Prometheus handles for one engine, pre-bound to its probe label.
#[derive(Debug, Clone)]
pub struct ExternalProbeMetrics {
    cycles: prometheus::IntCounter,
    success_results: prometheus::IntCounter,
    failure_results: prometheus::IntCounter,
    late_replies: prometheus::IntCounter,
    process_starts: prometheus::IntCounter,
}

impl ExternalProbeMetrics {
    /// Bind the engine's counters out of the agent's [`CoreMetrics`].
    pub fn new(metrics: &CoreMetrics, probe: &str) -> Self {
        Self {
            cycles: metrics.probe_cycles().with_label_values(&[probe]),
            success_results: metrics.probe_results().with_label_values(&[probe, "success"]),
            failure_results: metrics.probe_results().with_label_values(&[probe, "failure"]),
            late_replies: metrics.probe_late_replies().with_label_values(&[probe]),
            process_starts: metrics.probe_process_starts().with_label_values(&[probe]),
        }
    }
}

/// The external probe engine. One instance per configured probe; owns all
/// its bookkeeping and is driven by a single task.
pub struct ExternalProbe {
    name: String,
    mode: Mode,
    cmd_name: String,
    cmd_args: Vec<String>,
    env_vars: Vec<(String, String)>,
    opts: ProbeOptions,
    conf: ExternalProbeConf,
    metrics: ExternalProbeMetrics,

    // label names appearing as @tokens@ in options or args
    label_keys: HashSet<String>,
    payload_parser: Option<Parser>,

    // book-keeping
    request_id: i32,
    targets: Vec<Endpoint>,
    results: HashMap<String, ProbeResult>,
    process: Option<ServerProcess>,
    time_between_requests: Duration,
    data_tx: mpsc::Sender<EventMetrics>,
}

impl ExternalProbe {
    /// Initialize the engine. Fails when the command can't be split or the
    /// output-metrics options conflict with the mode's inferred kind.
    pub fn new(
        name: &str,
        conf: ExternalProbeConf,
        opts: ProbeOptions,
        data_tx: mpsc::Sender<EventMetrics>,
        metrics: ExternalProbeMetrics,
    ) -> Result<Self> {
        let cmd_parts = shlex::split(&conf.command)
            .ok_or_else(|| eyre!("error parsing command line {:?}", conf.command))?;
        let Some((cmd_name, cmd_args)) = cmd_parts.split_first() else {
            bail!("empty probe command");
        };

        let env_vars: Vec<(String, String)> = conf
            .env_var
            .iter()
            .map(|(k, v)| {
                let v = if v.is_empty() { "1" } else { v };
                (k.clone(), v.to_string())
            })
            .collect();

        let mut label_keys = HashSet::new();
        let mut scan = |s: &str| {
            for caps in SUBST_LABEL_RE.captures_iter(s) {
                label_keys.insert(caps[1].to_string());
            }
        };
        for opt in &conf.options {
            scan(&opt.value);
        }
        for arg in cmd_args {
            scan(arg);
        }

        let payload_parser = if conf.output_as_metrics {
            let default_kind = match conf.mode {
                Mode::Once => Kind::Gauge,
                Mode::Server => Kind::Cumulative,
            };
            Some(
                Parser::new(&conf.output_metrics_options, "external", name, default_kind)
                    .context("error initializing payload metrics")?,
            )
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            mode: conf.mode,
            cmd_name: cmd_name.clone(),
            cmd_args: cmd_args.to_vec(),
            env_vars,
            opts,
            conf,
            metrics,
            label_keys,
            payload_parser,
            request_id: 0,
            targets: Vec::new(),
            results: HashMap::new(),
            process: None,
            time_between_requests: TIME_BETWEEN_REQUESTS,
            data_tx,
        })
    }

    /// Run cycles on the probe's interval until `shutdown` fires.
    pub fn spawn(mut self, shutdown: watch::Receiver<bool>) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("ExternalProbe", probe = %self.name);
        tokio::spawn(async move { self.run(shutdown).await }).instrument(span)
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(self.opts.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!(probe = %self.name, "shutting down probe loop");
                    return Ok(());
                }
            }
            self.metrics.cycles.inc();
            self.run_probe(&shutdown).await;
        }
    }

    /// One probe cycle over the current target set, bounded by the probe
    /// timeout.
    async fn run_probe(&mut self, shutdown: &watch::Receiver<bool>) {
        self.update_targets();
        match self.mode {
            Mode::Server => {
                let deadline = Instant::now() + self.opts.timeout;
                self.run_server_probe(deadline, shutdown).await;
            }
            Mode::Once => self.run_once_probe().await,
        }
    }

    /// Refresh the target list, creating result accumulators for targets we
    /// haven't seen before.
    fn update_targets(&mut self) {
        self.targets = self.opts.targets.list_endpoints();

        for target in &self.targets {
            let key = target.key();
            if self.results.contains_key(&key) {
                continue;
            }
            let latency = match &self.opts.latency_dist {
                Some(dist) => Value::Dist(dist.clone()),
                None => Value::Float(0.0),
            };
            let validation_failure = (!self.opts.validators.is_empty())
                .then(|| validation_failure_map(&self.opts.validators));
            self.results.insert(
                key,
                ProbeResult {
                    total: 0,
                    success: 0,
                    latency,
                    validation_failure,
                },
            );
        }
    }

    /// Labels available for substitution against `ep`, restricted to the
    /// keys the config actually references.
    async fn labels(&self, ep: &Endpoint) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        if self.label_keys.contains("probe") {
            labels.insert("probe".to_string(), self.name.clone());
        }
        if self.label_keys.contains("target") {
            labels.insert("target".to_string(), ep.name.clone());
        }
        if self.label_keys.contains("port") {
            if let Some(port) = ep.port {
                labels.insert("port".to_string(), port.to_string());
            }
        }
        if self.label_keys.contains("address") {
            match self.opts.targets.resolve(&ep.name).await {
                Ok(addr) => {
                    labels.insert("address".to_string(), addr.to_string());
                }
                // the request is still sent; the token just stays put
                Err(err) => warn!(probe = %self.name, target = %ep.name, %err, "resolve failed"),
            }
        }
        for (k, v) in &ep.labels {
            let key = format!("target.label.{k}");
            if self.label_keys.contains(&key) {
                labels.insert(key, v.clone());
            }
        }
        labels
    }

    async fn build_request(&self, request_id: i32, ep: &Endpoint) -> ProbeRequest {
        let labels = if self.label_keys.is_empty() {
            None
        } else {
            Some(self.labels(ep).await)
        };

        let options = self
            .conf
            .options
            .iter()
            .map(|opt| {
                let mut value = opt.value.clone();
                if let Some(labels) = &labels {
                    let (substituted, found) = substitute_labels(&value, labels);
                    if found {
                        value = substituted;
                    } else {
                        warn!(probe = %self.name, option = %opt.value, "missing substitution in option");
                    }
                }
                RequestOption {
                    name: opt.name.clone(),
                    value,
                }
            })
            .collect();

        ProbeRequest {
            request_id,
            time_limit_msec: self.opts.timeout.as_millis() as i32,
            options,
        }
    }

    /// Start the server-mode process unless it is already running. Spawns
    /// the stderr drain, the stdout reply reader and the process watcher.
    fn start_cmd_if_not_running(&mut self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        if let Some(process) = &self.process {
            if process.running.load(Ordering::SeqCst) {
                return Ok(());
            }
        }

        info!(probe = %self.name, cmd = %self.conf.command, "starting external command");
        let mut cmd = Command::new(&self.cmd_name);
        cmd.args(&self.cmd_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.env_vars.is_empty() {
            cmd.envs(self.env_vars.iter().cloned());
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("error starting cmd {:?}", self.conf.command))?;
        self.metrics.process_starts.inc();

        let stdin = child.stdin.take().ok_or_else(|| eyre!("no stdin pipe"))?;
        let stdout = child.stdout.take().ok_or_else(|| eyre!("no stdout pipe"))?;
        let stderr = child.stderr.take().ok_or_else(|| eyre!("no stderr pipe"))?;
        let running = Arc::new(AtomicBool::new(true));

        // stderr is free-form; every line goes to the log
        let probe = self.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(probe = %probe, "stderr of probe process: {line}");
            }
        });

        // reply reader, tied to the process lifetime via stdout EOF
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let probe = self.name.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                match protocol::read_reply(&mut reader).await {
                    Ok(reply) => {
                        if reply_tx.send(reply).await.is_err() {
                            return;
                        }
                    }
                    Err(FrameError::Io(err)) => {
                        error!(probe = %probe, %err, "probe process pipe closed");
                        return;
                    }
                    Err(err) => {
                        error!(probe = %probe, %err, "error reading probe reply");
                    }
                }
            }
        });

        // watcher resets the running flag when the process exits, or kills
        // the process on shutdown
        let probe = self.name.clone();
        let running_w = running.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    running_w.store(false, Ordering::SeqCst);
                    match status {
                        Ok(status) => {
                            warn!(probe = %probe, %status, "external probe process died");
                        }
                        Err(err) => error!(probe = %probe, %err, "error waiting for probe process"),
                    }
                }
                _ = shutdown.changed() => {
                    running_w.store(false, Ordering::SeqCst);
                    let _ = child.kill().await;
                }
            }
        });

        self.process = Some(ServerProcess {
            stdin: Box::new(stdin),
            reply_rx,
            running,
        });
        Ok(())
    }

    /// Server-mode cycle: send one framed request per target, then match
    /// replies by id until none are outstanding or the deadline fires.
    /// Whatever is left outstanding afterwards is failed.
    async fn run_server_probe(&mut self, deadline: Instant, shutdown: &watch::Receiver<bool>) {
        if let Err(err) = self.start_cmd_if_not_running(shutdown) {
            error!(probe = %self.name, %err, "failed to start probe process");
            return;
        }

        let mut outstanding: HashMap<i32, RequestInfo> = HashMap::new();

        // send requests
        let targets = self.targets.clone();
        for target in targets {
            self.request_id += 1;
            let request_id = self.request_id;
            if let Some(result) = self.results.get_mut(&target.key()) {
                result.total += 1;
            }
            let request = self.build_request(request_id, &target).await;
            debug!(probe = %self.name, request_id, target = %target.name, "sending probe request");
            outstanding.insert(
                request_id,
                RequestInfo {
                    target,
                    sent_at: Instant::now(),
                },
            );

            let Some(process) = self.process.as_mut() else {
                break;
            };
            if let Err(err) = protocol::write_message(&request, &mut process.stdin).await {
                // abort the remaining sends; everything outstanding times
                // out as failures below
                error!(probe = %self.name, %err, "error sending probe request");
                break;
            }
            sleep(self.time_between_requests).await;
        }

        // match replies until we run out of outstanding requests or time
        while !outstanding.is_empty() {
            let Some(process) = self.process.as_mut() else {
                break;
            };
            let reply = tokio::select! {
                _ = sleep_until(deadline) => break,
                maybe_reply = process.reply_rx.recv() => match maybe_reply {
                    Some(reply) => reply,
                    None => break,
                },
            };

            let Some(info) = outstanding.remove(&reply.request_id) else {
                // not ours, probably a late reply for a previous cycle's
                // timed out request
                warn!(
                    probe = %self.name,
                    request_id = reply.request_id,
                    "got a reply that doesn't match any outstanding request, ignoring"
                );
                self.metrics.late_replies.inc();
                continue;
            };

            let success = reply.error_message.is_empty();
            if !success {
                error!(
                    probe = %self.name,
                    target = %info.target.name,
                    error_message = %reply.error_message,
                    "probe failed"
                );
            }
            self.process_probe_result(ProbeStatus {
                target: info.target,
                success,
                latency: info.sent_at.elapsed(),
                payload: reply.payload,
            })
            .await;
        }

        // requests we never heard back about are failures
        for (_, info) in outstanding.drain() {
            self.process_probe_result(ProbeStatus {
                target: info.target,
                success: false,
                latency: Duration::ZERO,
                payload: String::new(),
            })
            .await;
        }
    }

    /// Once-mode cycle: run the command against every target in parallel and
    /// join all runs before the cycle ends.
    async fn run_once_probe(&mut self) {
        let mut runs = Vec::with_capacity(self.targets.len());
        let targets = self.targets.clone();
        for target in targets {
            if let Some(result) = self.results.get_mut(&target.key()) {
                result.total += 1;
            }

            let mut args = self.cmd_args.clone();
            if !self.label_keys.is_empty() {
                let labels = self.labels(&target).await;
                for arg in &mut args {
                    let (substituted, found) = substitute_labels(arg, &labels);
                    if !found {
                        warn!(probe = %self.name, arg = %arg, "substitution not found");
                    }
                    *arg = substituted;
                }
            }

            let cmd_name = self.cmd_name.clone();
            let env_vars = self.env_vars.clone();
            let cycle_timeout = self.opts.timeout;
            let probe = self.name.clone();
            runs.push(tokio::spawn(async move {
                run_once_command(probe, cmd_name, args, env_vars, cycle_timeout, target).await
            }));
        }

        for run in runs {
            match run.await {
                Ok(status) => self.process_probe_result(status).await,
                Err(err) => error!(probe = %self.name, %err, "probe task panicked"),
            }
        }
    }

    /// Validate and account one probe outcome, then emit its metrics.
    async fn process_probe_result(&mut self, mut status: ProbeStatus) {
        let Some(result) = self.results.get_mut(&status.target.key()) else {
            return;
        };

        if status.success && !self.opts.validators.is_empty() {
            if let Some(failure_map) = result.validation_failure.as_mut() {
                let failed =
                    run_validators(&self.opts.validators, status.payload.as_bytes(), failure_map);
                if !failed.is_empty() {
                    debug!(
                        probe = %self.name,
                        target = %status.target.name,
                        failed = failed.join(","),
                        "validation failed"
                    );
                    status.success = false;
                }
            }
        }

        if status.success {
            result.success += 1;
            let scaled = status.latency.as_secs_f64() / self.opts.latency_unit.as_secs_f64();
            if let Err(err) = result.latency.add_f64(scaled) {
                warn!(probe = %self.name, %err, "error recording latency");
            }
            self.metrics.success_results.inc();
        } else {
            self.metrics.failure_results.inc();
        }

        let mut em = EventMetrics::new(Utc::now())
            .with_metric("success", Value::Int(result.success))
            .with_metric("total", Value::Int(result.total))
            .with_metric("latency", result.latency.clone())
            .with_label("ptype", "external")
            .with_label("probe", &self.name)
            .with_label("dst", &status.target.name);
        em.latency_unit = self.opts.latency_unit;
        if let Some(validation_failure) = &result.validation_failure {
            em.add_metric("validation_failure", Value::Map(validation_failure.clone()));
        }
        for (k, v) in &self.opts.additional_labels {
            em.add_label(k, v);
        }
        debug!(probe = %self.name, metrics = %em, "probe metrics");
        if self.data_tx.send(em).await.is_err() {
            return;
        }

        if let Some(parser) = self.payload_parser.as_mut() {
            for mut em in parser.payload_metrics(&status.payload, &status.target.name) {
                for (k, v) in &self.opts.additional_labels {
                    em.add_label(k, v);
                }
                if self.data_tx.send(em).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Run one once-mode command to completion, under the cycle timeout.
async fn run_once_command(
    probe: String,
    cmd_name: String,
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
    cycle_timeout: Duration,
    target: Endpoint,
) -> ProbeStatus {
    info!(probe = %probe, cmd = %cmd_name, args = ?args, "running external command");
    let mut cmd = Command::new(&cmd_name);
    cmd.args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if !env_vars.is_empty() {
        cmd.envs(env_vars);
    }

    let started = Instant::now();
    let (success, payload) = match timeout(cycle_timeout, cmd.output()).await {
        Ok(Ok(output)) => {
            if !output.stderr.is_empty() {
                warn!(probe = %probe, "stderr: {}", String::from_utf8_lossy(&output.stderr));
            }
            if !output.status.success() {
                error!(
                    probe = %probe,
                    status = %output.status,
                    "external probe process exited non-zero"
                );
            }
            (
                output.status.success(),
                String::from_utf8_lossy(&output.stdout).into_owned(),
            )
        }
        Ok(Err(err)) => {
            error!(probe = %probe, %err, "error executing the external program");
            (false, String::new())
        }
        Err(_) => {
            error!(probe = %probe, target = %target.name, "probe command timed out");
            (false, String::new())
        }
    };

    ProbeStatus {
        target,
        success,
        latency: started.elapsed(),
        payload,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fleetprober_core::validators::RegexValidator;
    use fleetprober_core::StaticTargets;
    use prometheus::Registry;
    use tokio::io::duplex;

    fn test_metrics() -> ExternalProbeMetrics {
        let core = CoreMetrics::new("test", None, Registry::new()).unwrap();
        ExternalProbeMetrics::new(&core, "test-probe")
    }

    fn test_opts(names: &[&str]) -> ProbeOptions {
        let endpoints = names.iter().map(|n| Endpoint::new(*n)).collect();
        let mut opts = ProbeOptions::new(Arc::new(StaticTargets::new(endpoints)));
        opts.interval = Duration::from_millis(10);
        opts.timeout = Duration::from_secs(5);
        opts
    }

    fn test_conf(command: &str, mode: Mode) -> ExternalProbeConf {
        ExternalProbeConf {
            command: command.to_string(),
            mode,
            env_var: BTreeMap::new(),
            options: Vec::new(),
            output_as_metrics: false,
            output_metrics_options: PayloadParserOpts::default(),
        }
    }

    fn test_probe(
        conf: ExternalProbeConf,
        opts: ProbeOptions,
    ) -> (ExternalProbe, mpsc::Receiver<EventMetrics>) {
        let (data_tx, data_rx) = mpsc::channel(100);
        let probe = ExternalProbe::new("test-probe", conf, opts, data_tx, test_metrics()).unwrap();
        (probe, data_rx)
    }

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    fn drain(rx: &mut mpsc::Receiver<EventMetrics>) -> Vec<EventMetrics> {
        let mut out = Vec::new();
        while let Ok(em) = rx.try_recv() {
            out.push(em);
        }
        out
    }

    fn counters_for(ems: &[EventMetrics], dst: &str) -> (i64, i64) {
        let em = ems
            .iter()
            .rev()
            .find(|em| em.label("dst") == Some(dst) && em.metric("total").is_some())
            .expect("no sample for target");
        (
            em.metric("total").and_then(Value::int64).unwrap(),
            em.metric("success").and_then(Value::int64).unwrap(),
        )
    }

    #[test]
    fn init_parses_command_and_label_keys() {
        let mut conf = test_conf("/usr/bin/probe --addr=@address@ --x=@target.label.zone@", Mode::Once);
        conf.options.push(OptionPair {
            name: "t".to_string(),
            value: "@target@:@port@".to_string(),
        });
        let (probe, _rx) = test_probe(conf, test_opts(&["t1"]));

        assert_eq!(probe.cmd_name, "/usr/bin/probe");
        assert_eq!(probe.cmd_args, vec!["--addr=@address@", "--x=@target.label.zone@"]);
        for key in ["target", "port", "address", "target.label.zone"] {
            assert!(probe.label_keys.contains(key), "missing {key}");
        }
        assert!(!probe.label_keys.contains("probe"));
    }

    #[test]
    fn init_rejects_bad_commands() {
        let (data_tx, _rx) = mpsc::channel(1);
        let bad = ExternalProbe::new(
            "p",
            test_conf("probe 'unclosed", Mode::Once),
            test_opts(&[]),
            data_tx.clone(),
            test_metrics(),
        );
        assert!(bad.is_err());

        let empty = ExternalProbe::new(
            "p",
            test_conf("", Mode::Once),
            test_opts(&[]),
            data_tx,
            test_metrics(),
        );
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn once_mode_success_and_accumulation() {
        let (mut probe, mut rx) = test_probe(
            test_conf("echo hello", Mode::Once),
            test_opts(&["t1", "t2"]),
        );
        let (_tx, shutdown) = shutdown_pair();

        probe.run_probe(&shutdown).await;
        let ems = drain(&mut rx);
        assert_eq!(ems.len(), 2);
        assert_eq!(counters_for(&ems, "t1"), (1, 1));
        assert_eq!(counters_for(&ems, "t2"), (1, 1));

        probe.run_probe(&shutdown).await;
        let ems = drain(&mut rx);
        assert_eq!(counters_for(&ems, "t1"), (2, 2));
    }

    #[tokio::test]
    async fn once_mode_nonzero_exit_is_failure() {
        let (mut probe, mut rx) =
            test_probe(test_conf("sh -c 'exit 3'", Mode::Once), test_opts(&["t1"]));
        let (_tx, shutdown) = shutdown_pair();

        probe.run_probe(&shutdown).await;
        assert_eq!(counters_for(&drain(&mut rx), "t1"), (1, 0));
    }

    #[tokio::test]
    async fn once_mode_validators_flip_success() {
        let mut opts = test_opts(&["t1"]);
        opts.validators = vec![Arc::new(RegexValidator::new("want-ok", "OK").unwrap())];
        let (mut probe, mut rx) = test_probe(test_conf("echo FAIL", Mode::Once), opts);
        let (_tx, shutdown) = shutdown_pair();

        probe.run_probe(&shutdown).await;
        let ems = drain(&mut rx);
        assert_eq!(counters_for(&ems, "t1"), (1, 0));
        let Some(Value::Map(failures)) = ems[0].metric("validation_failure") else {
            panic!("expected validation_failure map");
        };
        assert_eq!(failures.get("want-ok"), 1);
    }

    #[tokio::test]
    async fn once_mode_payload_metrics() {
        let mut conf = test_conf("echo requests 10", Mode::Once);
        conf.output_as_metrics = true;
        let (mut probe, mut rx) = test_probe(conf, test_opts(&["t1"]));
        let (_tx, shutdown) = shutdown_pair();

        probe.run_probe(&shutdown).await;
        let ems = drain(&mut rx);
        assert_eq!(ems.len(), 2);
        // the default sample plus the parsed payload sample
        assert_eq!(counters_for(&ems, "t1"), (1, 1));
        assert_eq!(ems[1].metric("requests"), Some(&Value::Int(10)));
        assert_eq!(ems[1].kind, Kind::Gauge);
        assert_eq!(ems[1].label("ptype"), Some("external"));
    }

    // Wires a fake server-mode process out of an in-memory pipe (for stdin)
    // and a directly-driven reply channel, skipping process startup.
    fn fake_server_process(
        probe: &mut ExternalProbe,
    ) -> (tokio::io::DuplexStream, mpsc::Sender<ProbeReply>) {
        let (stdin_ours, stdin_theirs) = duplex(64 * 1024);
        let (reply_tx, reply_rx) = mpsc::channel(1);
        probe.process = Some(ServerProcess {
            stdin: Box::new(stdin_ours),
            reply_rx,
            running: Arc::new(AtomicBool::new(true)),
        });
        (stdin_theirs, reply_tx)
    }

    #[tokio::test]
    async fn server_mode_matches_out_of_order_replies() {
        let mut conf = test_conf("/bin/true", Mode::Server);
        conf.options.push(OptionPair {
            name: "target".to_string(),
            value: "@target@".to_string(),
        });
        let (mut probe, mut rx) = test_probe(conf, test_opts(&["t1", "t2", "t3"]));
        let (_tx, shutdown) = shutdown_pair();
        probe.update_targets();

        let (stdin_theirs, reply_tx) = fake_server_process(&mut probe);
        let server = tokio::spawn(async move {
            let mut reader = BufReader::new(stdin_theirs);
            let mut requests = Vec::new();
            for _ in 0..3 {
                let req: ProbeRequest = protocol::read_message(&mut reader).await.unwrap();
                requests.push(req);
            }
            // ids are assigned in target order, starting at 1
            let ids: Vec<i32> = requests.iter().map(|r| r.request_id).collect();
            assert_eq!(ids, vec![1, 2, 3]);
            let opts: Vec<&str> = requests
                .iter()
                .map(|r| r.options[0].value.as_str())
                .collect();
            assert_eq!(opts, vec!["t1", "t2", "t3"]);

            // reply out of order; fail the request that belongs to t2
            for (id, error) in [(2, "boom"), (1, ""), (3, "")] {
                reply_tx
                    .send(ProbeReply {
                        request_id: id,
                        payload: String::new(),
                        error_message: error.to_string(),
                    })
                    .await
                    .unwrap();
            }
        });

        probe
            .run_server_probe(Instant::now() + Duration::from_secs(5), &shutdown)
            .await;
        server.await.unwrap();

        let ems = drain(&mut rx);
        assert_eq!(ems.len(), 3);
        assert_eq!(counters_for(&ems, "t1"), (1, 1));
        assert_eq!(counters_for(&ems, "t2"), (1, 0));
        assert_eq!(counters_for(&ems, "t3"), (1, 1));
    }

    #[tokio::test]
    async fn server_mode_fails_leftovers_at_deadline_and_ids_stay_monotonic() {
        let (mut probe, mut rx) = test_probe(
            test_conf("/bin/true", Mode::Server),
            test_opts(&["t1", "t2"]),
        );
        let (_tx, shutdown) = shutdown_pair();
        probe.update_targets();

        let (stdin_theirs, reply_tx) = fake_server_process(&mut probe);
        let reply_tx2 = reply_tx.clone();
        let server = tokio::spawn(async move {
            let mut reader = BufReader::new(stdin_theirs);
            let first: ProbeRequest = protocol::read_message(&mut reader).await.unwrap();
            let _second: ProbeRequest = protocol::read_message(&mut reader).await.unwrap();
            // answer only the first request; the second times out
            reply_tx2
                .send(ProbeReply {
                    request_id: first.request_id,
                    payload: String::new(),
                    error_message: String::new(),
                })
                .await
                .unwrap();
            reader
        });

        probe
            .run_server_probe(Instant::now() + Duration::from_millis(300), &shutdown)
            .await;
        let mut reader = server.await.unwrap();

        let ems = drain(&mut rx);
        assert_eq!(ems.len(), 2);
        assert_eq!(counters_for(&ems, "t1"), (1, 1));
        assert_eq!(counters_for(&ems, "t2"), (1, 0));

        // a second cycle keeps counting ids upwards
        let server = tokio::spawn(async move {
            let third: ProbeRequest = protocol::read_message(&mut reader).await.unwrap();
            let fourth: ProbeRequest = protocol::read_message(&mut reader).await.unwrap();
            assert_eq!((third.request_id, fourth.request_id), (3, 4));
            for id in [3, 4] {
                reply_tx
                    .send(ProbeReply {
                        request_id: id,
                        payload: String::new(),
                        error_message: String::new(),
                    })
                    .await
                    .unwrap();
            }
        });
        probe
            .run_server_probe(Instant::now() + Duration::from_secs(5), &shutdown)
            .await;
        server.await.unwrap();

        let ems = drain(&mut rx);
        assert_eq!(counters_for(&ems, "t1"), (2, 2));
        assert_eq!(counters_for(&ems, "t2"), (2, 1));
    }

    #[tokio::test]
    async fn server_mode_ignores_late_replies() {
        let (mut probe, mut rx) = test_probe(
            test_conf("/bin/true", Mode::Server),
            test_opts(&["t1"]),
        );
        let (_tx, shutdown) = shutdown_pair();
        probe.update_targets();

        let (stdin_theirs, reply_tx) = fake_server_process(&mut probe);
        let server = tokio::spawn(async move {
            let mut reader = BufReader::new(stdin_theirs);
            let req: ProbeRequest = protocol::read_message(&mut reader).await.unwrap();
            // a stale reply from some previous cycle arrives first
            for id in [9999, req.request_id] {
                reply_tx
                    .send(ProbeReply {
                        request_id: id,
                        payload: String::new(),
                        error_message: String::new(),
                    })
                    .await
                    .unwrap();
            }
        });

        probe
            .run_server_probe(Instant::now() + Duration::from_secs(5), &shutdown)
            .await;
        server.await.unwrap();

        assert_eq!(probe.metrics.late_replies.get(), 1);
        assert_eq!(counters_for(&drain(&mut rx), "t1"), (1, 1));
    }

    #[tokio::test]
    async fn server_mode_end_to_end_with_real_process() {
        // a minimal real "probe server": emits one hand-encoded reply frame
        // (request_id = 1, empty payload and error) and stays alive
        let cmd = r#"sh -c 'printf "Content-Length: 2\n\n\010\001"; sleep 2'"#;
        let (mut probe, mut rx) = test_probe(test_conf(cmd, Mode::Server), test_opts(&["t1"]));
        let (_tx, shutdown) = shutdown_pair();

        probe.update_targets();
        probe
            .run_server_probe(Instant::now() + Duration::from_secs(5), &shutdown)
            .await;

        assert_eq!(counters_for(&drain(&mut rx), "t1"), (1, 1));
        assert_eq!(probe.metrics.process_starts.get(), 1);
    }

    #[tokio::test]
    async fn latency_goes_into_the_configured_distribution() {
        let mut opts = test_opts(&["t1"]);
        opts.latency_dist =
            Some(fleetprober_core::metrics::Distribution::from_spec("0.001,1,10,100").unwrap());
        let (mut probe, mut rx) = test_probe(test_conf("echo hi", Mode::Once), opts);
        let (_tx, shutdown) = shutdown_pair();

        probe.run_probe(&shutdown).await;
        let ems = drain(&mut rx);
        let Some(Value::Dist(dist)) = ems[0].metric("latency") else {
            panic!("expected latency distribution");
        };
        assert_eq!(dist.count(), 1);
    }
}
