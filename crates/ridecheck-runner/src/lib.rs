//! Orchestration for the concurrency exercises: drives external executables
//! through repeated trials, captures their output, and reports per-fixture
//! and per-scenario outcomes.
//!
//! The harness itself is sequential. All concurrency lives inside the
//! executables under test; each invocation is an opaque unit of work bounded
//! by a wall-clock timeout. Because the systems under test are racy by
//! construction, a single passing trial proves nothing, so every fixture and
//! scenario is run many times and passes only if every repetition does.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use ridecheck_core::{build_plan, ensure_dir, parse_events, validate, DuplicatePolicy, Plan};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Structured description of one executable invocation. Never a shell
/// string: arguments are passed through verbatim with no quoting hazards.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Human-readable command line for headers and logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// What came back from one bounded invocation.
#[derive(Debug)]
pub struct Captured {
    pub stdout: Vec<u8>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

fn spawn(mut cmd: Command, invocation: &Invocation) -> Result<Child> {
    cmd.spawn().map_err(|err| {
        // A missing or non-executable program is a setup problem, not a
        // defect in the system under test. Say so plainly.
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => anyhow!(
                "cannot launch {}: {} (is the executable built?)",
                invocation.program.display(),
                err
            ),
            _ => anyhow!("failed to launch {}: {}", invocation.program.display(), err),
        }
    })
}

/// Runs an invocation with `stdin_bytes` on its standard input, capturing
/// stdout, bounded by `timeout`.
///
/// Stdout is drained by a dedicated thread so a chatty child can never fill
/// the pipe and deadlock against our wait loop. On timeout the child is
/// killed; killing closes the pipe, which unblocks the reader, and whatever
/// had been buffered up to that point is returned.
pub fn run_captured(invocation: &Invocation, stdin_bytes: &[u8], timeout: Duration) -> Result<Captured> {
    let mut cmd = invocation.command();
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let mut child = spawn(cmd, invocation)?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout was not captured"))?;
    let reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    // Feed stdin off-thread so a child that never drains its input cannot
    // block the wait loop; dropping the handle signals EOF. The child may
    // also exit early, and the resulting broken pipe is its business.
    let writer = child.stdin.take().map(|mut stdin| {
        let bytes = stdin_bytes.to_vec();
        thread::spawn(move || {
            let _ = stdin.write_all(&bytes);
        })
    });

    let deadline = Instant::now() + timeout;
    let (exit_code, timed_out) = loop {
        match child.try_wait().context("waiting for child process")? {
            Some(status) => break (status.code(), false),
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let status = child.wait().context("reaping timed-out child")?;
                break (status.code(), true);
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };
    let stdout = reader
        .join()
        .map_err(|_| anyhow!("stdout reader thread panicked"))?;
    if let Some(writer) = writer {
        let _ = writer.join();
    }
    Ok(Captured {
        stdout,
        exit_code,
        timed_out,
    })
}

/// Runs an invocation with output streamed straight to the console, bounded
/// by `timeout`. Returns whether the child had to be killed.
pub fn run_streaming(invocation: &Invocation, timeout: Duration) -> Result<bool> {
    let mut cmd = invocation.command();
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    let mut child = spawn(cmd, invocation)?;
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait().context("waiting for child process")? {
            Some(_) => return Ok(false),
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(true);
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    }
}

/// Outcome of a single dispatch trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    Passed,
    Failed { artifact: PathBuf },
    TimedOut { artifact: PathBuf },
}

/// Knobs for a fixture sweep.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub repetitions: u32,
    pub timeout: Duration,
    pub debug_dir: PathBuf,
    pub duplicates: DuplicatePolicy,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            repetitions: 10,
            timeout: Duration::from_secs(10),
            debug_dir: PathBuf::from("debug"),
            duplicates: DuplicatePolicy::LastWins,
        }
    }
}

/// Persists raw captured output for postmortem inspection. One file per
/// fixture, overwritten on each new failure, never auto-cleaned.
pub fn write_debug_artifact(debug_dir: &Path, fixture_name: &str, output: &[u8]) -> Result<PathBuf> {
    ensure_dir(debug_dir).with_context(|| format!("creating {}", debug_dir.display()))?;
    let path = debug_dir.join(format!("{fixture_name}.out"));
    fs::write(&path, output).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// One trial: feed the fixture verbatim on stdin, validate the captured
/// output against the plan. Output is only persisted on the non-passing
/// paths so successful runs do not flood storage.
pub fn run_trial(
    invocation: &Invocation,
    fixture_name: &str,
    fixture_bytes: &[u8],
    plan: &Plan,
    options: &SweepOptions,
) -> Result<TrialOutcome> {
    let captured = run_captured(invocation, fixture_bytes, options.timeout)?;
    if captured.timed_out {
        warn!(fixture = fixture_name, "trial timed out");
        let artifact = write_debug_artifact(&options.debug_dir, fixture_name, &captured.stdout)?;
        return Ok(TrialOutcome::TimedOut { artifact });
    }
    let events = parse_events(&captured.stdout);
    let verdict = validate(plan, &events);
    if verdict.is_valid() {
        return Ok(TrialOutcome::Passed);
    }
    debug!(fixture = fixture_name, ?verdict, "validation failed");
    let artifact = write_debug_artifact(&options.debug_dir, fixture_name, &captured.stdout)?;
    Ok(TrialOutcome::Failed { artifact })
}

/// Runs `trial` up to `repetitions` times, short-circuiting on the first
/// non-passing outcome. Generic over the trial closure so the short-circuit
/// law is testable without launching processes.
pub fn run_repeated<F>(repetitions: u32, mut trial: F) -> Result<TrialOutcome>
where
    F: FnMut() -> Result<TrialOutcome>,
{
    for _ in 0..repetitions {
        let outcome = trial()?;
        if outcome != TrialOutcome::Passed {
            return Ok(outcome);
        }
    }
    Ok(TrialOutcome::Passed)
}

/// Fixture-level verdict, aggregated over all repetitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FixtureStatus {
    Passed,
    Failed { artifact: PathBuf },
    TimedOut { artifact: PathBuf },
    Malformed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FixtureReport {
    pub fixture: String,
    #[serde(flatten)]
    pub status: FixtureStatus,
}

/// Runs one fixture: parse the plan once, reuse it read-only across every
/// repetition. A malformed fixture aborts this fixture only.
pub fn run_fixture(
    invocation: &Invocation,
    fixture_path: &Path,
    options: &SweepOptions,
) -> Result<FixtureStatus> {
    let name = fixture_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fixture".to_string());
    let bytes = fs::read(fixture_path)
        .with_context(|| format!("reading fixture {}", fixture_path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let plan = match build_plan(&text, options.duplicates) {
        Ok(plan) => plan,
        Err(err) => {
            return Ok(FixtureStatus::Malformed {
                message: err.to_string(),
            })
        }
    };
    info!(fixture = name.as_str(), records = plan.len(), "running fixture");
    let outcome = run_repeated(options.repetitions, || {
        run_trial(invocation, &name, &bytes, &plan, options)
    })?;
    Ok(match outcome {
        TrialOutcome::Passed => FixtureStatus::Passed,
        TrialOutcome::Failed { artifact } => FixtureStatus::Failed { artifact },
        TrialOutcome::TimedOut { artifact } => FixtureStatus::TimedOut { artifact },
    })
}

/// Runs every fixture file in `fixture_dir`, sorted by name, invoking
/// `observe` as each report becomes available. A failing fixture never
/// aborts the sweep; a launch failure does, because nothing else can pass
/// either.
pub fn sweep_fixtures(
    invocation: &Invocation,
    fixture_dir: &Path,
    options: &SweepOptions,
    mut observe: impl FnMut(&FixtureReport),
) -> Result<Vec<FixtureReport>> {
    if !fixture_dir.is_dir() {
        bail!("fixture directory not found: {}", fixture_dir.display());
    }
    let fixtures: Vec<PathBuf> = WalkDir::new(fixture_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();

    let mut reports = Vec::with_capacity(fixtures.len());
    for path in fixtures {
        let status = run_fixture(invocation, &path, options)?;
        let report = FixtureReport {
            fixture: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            status,
        };
        observe(&report);
        reports.push(report);
    }
    Ok(reports)
}

/// Scenario numbers above this are slow stress variants, skipped by the
/// run-everything default unless explicitly unlocked.
pub const MAX_DEFAULT_SCENARIO: u32 = 6;
pub const SCENARIO_ITERATIONS: u32 = 20;
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(2);
pub const SUCCESS_MARKER: &[u8] = b"Success!\n";

/// One entry of the fixed matrix for the matching simulator: positional
/// request/driver/repetition counts plus an optional behavioral flag.
#[derive(Debug, Clone, Serialize)]
pub struct Scenario {
    pub number: u32,
    pub args: Vec<String>,
    pub description: &'static str,
}

impl Scenario {
    fn new(number: u32, args: &[&str], description: &'static str) -> Self {
        Self {
            number,
            args: args.iter().map(|a| a.to_string()).collect(),
            description,
        }
    }

    pub fn invocation(&self, program: &Path) -> Invocation {
        Invocation::with_args(program, self.args.iter().cloned())
    }
}

pub fn scenario_matrix() -> Vec<Scenario> {
    vec![
        Scenario::new(1, &["10", "1", "5"], "basic functionality"),
        Scenario::new(2, &["50", "5", "5"], "multiple drivers"),
        Scenario::new(3, &["100", "20", "5"], "more requests and drivers"),
        Scenario::new(4, &["4000", "100", "5"], "stress test"),
        Scenario::new(5, &["1", "100", "1"], "many drivers, one request"),
        Scenario::new(6, &["1", "1", "1"], "one request, one driver"),
        Scenario::new(7, &["10", "1", "5", "--mix-up-meals"], "mix up meals"),
        Scenario::new(
            8,
            &["10", "5", "5", "--mix-up-meals"],
            "mix up meals with more drivers",
        ),
        Scenario::new(
            9,
            &["100", "5", "5", "--mix-up-meals"],
            "mix up meals stress test",
        ),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioSelection {
    All,
    Single(u32),
    Range(u32, u32),
}

pub fn parse_selection(spec: Option<&str>) -> Result<ScenarioSelection> {
    let Some(raw) = spec else {
        return Ok(ScenarioSelection::All);
    };
    if let Some((lo, hi)) = raw.split_once('-') {
        let lo = lo
            .trim()
            .parse()
            .with_context(|| format!("invalid scenario range {raw:?}"))?;
        let hi = hi
            .trim()
            .parse()
            .with_context(|| format!("invalid scenario range {raw:?}"))?;
        if lo > hi {
            bail!("invalid scenario range {raw:?}: {lo} > {hi}");
        }
        Ok(ScenarioSelection::Range(lo, hi))
    } else {
        let number = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid scenario number {raw:?}"))?;
        Ok(ScenarioSelection::Single(number))
    }
}

/// Picks the scenarios to run. An explicit selection always unlocks the
/// slow scenarios; only the run-everything default is capped, and `extra`
/// lifts that cap.
pub fn select_scenarios(
    matrix: &[Scenario],
    selection: ScenarioSelection,
    extra: bool,
) -> Vec<Scenario> {
    let (lo, hi) = match selection {
        ScenarioSelection::All => {
            let lo = matrix.first().map(|s| s.number).unwrap_or(0);
            let mut hi = matrix.last().map(|s| s.number).unwrap_or(0);
            if !extra {
                hi = hi.min(MAX_DEFAULT_SCENARIO);
            }
            (lo, hi)
        }
        ScenarioSelection::Single(n) => (n, n),
        ScenarioSelection::Range(lo, hi) => (lo, hi),
    };
    matrix
        .iter()
        .filter(|s| s.number >= lo && s.number <= hi)
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Passed,
    Failed { iteration: u32, output: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub number: u32,
    pub command: String,
    pub description: &'static str,
    #[serde(flatten)]
    pub outcome: ScenarioOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioSummary {
    pub succeeded: u32,
    pub failed: u32,
    pub total: u32,
}

/// An iteration passes iff the captured output is exactly the success
/// marker. Stops at the first failing iteration and reports its 1-based
/// index and what was actually produced.
pub fn run_scenario(program: &Path, scenario: &Scenario) -> Result<ScenarioOutcome> {
    let invocation = scenario.invocation(program);
    for iteration in 1..=SCENARIO_ITERATIONS {
        let captured = run_captured(&invocation, &[], SCENARIO_TIMEOUT)?;
        if captured.timed_out {
            return Ok(ScenarioOutcome::Failed {
                iteration,
                output: format!("Timed out after {} seconds!", SCENARIO_TIMEOUT.as_secs()),
            });
        }
        if captured.stdout != SUCCESS_MARKER {
            return Ok(ScenarioOutcome::Failed {
                iteration,
                output: String::from_utf8_lossy(&captured.stdout).into_owned(),
            });
        }
    }
    Ok(ScenarioOutcome::Passed)
}

/// Runs the selected scenarios in order. A failing scenario never aborts
/// the rest of the matrix.
pub fn run_scenarios(
    program: &Path,
    scenarios: &[Scenario],
    mut observe: impl FnMut(&ScenarioReport),
) -> Result<(Vec<ScenarioReport>, ScenarioSummary)> {
    let mut reports = Vec::with_capacity(scenarios.len());
    let mut summary = ScenarioSummary::default();
    for scenario in scenarios {
        summary.total += 1;
        let outcome = run_scenario(program, scenario)?;
        match outcome {
            ScenarioOutcome::Passed => summary.succeeded += 1,
            ScenarioOutcome::Failed { .. } => summary.failed += 1,
        }
        let report = ScenarioReport {
            number: scenario.number,
            command: scenario.invocation(program).command_line(),
            description: scenario.description,
            outcome,
        };
        observe(&report);
        reports.push(report);
    }
    Ok((reports, summary))
}

pub const DEMO_TIMEOUT: Duration = Duration::from_secs(30);

/// The estimator's three behavioral modes, in demonstration order.
#[derive(Debug, Clone, Copy)]
pub struct Demo {
    pub mode: &'static str,
    pub description: &'static str,
}

pub fn demo_matrix() -> Vec<Demo> {
    vec![
        Demo {
            mode: "0",
            description: "Vanilla passenger version",
        },
        Demo {
            mode: "1",
            description: "Better initialization",
        },
        Demo {
            mode: "2",
            description: "Better initialization and trylocking",
        },
    ]
}

/// Streams one estimator demo to the console. Returns whether it timed out.
pub fn run_demo(program: &Path, demo: &Demo) -> Result<bool> {
    let invocation = Invocation::with_args(program, [demo.mode]);
    run_streaming(&invocation, DEMO_TIMEOUT)
}

/// Synthesizes `count` well-formed fixture lines: a random requester in
/// [0,100), a sequential logical time, and an origin/destination coordinate
/// pair formatted to two decimals.
pub fn generate_fixture<R: Rng>(count: usize, rng: &mut R) -> String {
    let mut out = String::new();
    for time in 0..count {
        let requester = rng.gen_range(0..100u32);
        let orig_lat = rng.gen_range(-90.0..=90.0f64);
        let orig_lon = rng.gen_range(-180.0..=180.0f64);
        let dst_lat = rng.gen_range(-90.0..=90.0f64);
        let dst_lon = rng.gen_range(-180.0..=180.0f64);
        out.push_str(&format!(
            "{requester} {time} {orig_lat:.2} {orig_lon:.2} {dst_lat:.2} {dst_lon:.2}\n"
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn repetition_passes_only_when_every_trial_passes() {
        let mut calls = 0;
        let outcome = run_repeated(10, || {
            calls += 1;
            Ok(TrialOutcome::Passed)
        })
        .unwrap();
        assert_eq!(outcome, TrialOutcome::Passed);
        assert_eq!(calls, 10);
    }

    #[test]
    fn repetition_short_circuits_on_first_failure() {
        let mut calls = 0;
        let artifact = PathBuf::from("debug/t.out");
        let outcome = run_repeated(10, || {
            calls += 1;
            if calls == 3 {
                Ok(TrialOutcome::Failed {
                    artifact: artifact.clone(),
                })
            } else {
                Ok(TrialOutcome::Passed)
            }
        })
        .unwrap();
        assert_eq!(outcome, TrialOutcome::Failed { artifact });
        assert_eq!(calls, 3);
    }

    #[test]
    fn repetition_surfaces_timeouts() {
        let artifact = PathBuf::from("debug/t.out");
        let outcome = run_repeated(5, || {
            Ok(TrialOutcome::TimedOut {
                artifact: artifact.clone(),
            })
        })
        .unwrap();
        assert_eq!(outcome, TrialOutcome::TimedOut { artifact });
    }

    #[test]
    fn selection_parses_single_range_and_default() {
        assert_eq!(parse_selection(None).unwrap(), ScenarioSelection::All);
        assert_eq!(
            parse_selection(Some("4")).unwrap(),
            ScenarioSelection::Single(4)
        );
        assert_eq!(
            parse_selection(Some("2-5")).unwrap(),
            ScenarioSelection::Range(2, 5)
        );
        assert!(parse_selection(Some("x")).is_err());
        assert!(parse_selection(Some("5-2")).is_err());
    }

    #[test]
    fn default_selection_is_capped_without_extra() {
        let matrix = scenario_matrix();
        let chosen = select_scenarios(&matrix, ScenarioSelection::All, false);
        assert_eq!(
            chosen.last().map(|s| s.number),
            Some(MAX_DEFAULT_SCENARIO)
        );
        let all = select_scenarios(&matrix, ScenarioSelection::All, true);
        assert_eq!(all.len(), matrix.len());
    }

    #[test]
    fn explicit_selection_unlocks_slow_scenarios() {
        let matrix = scenario_matrix();
        let single = select_scenarios(&matrix, ScenarioSelection::Single(8), false);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].number, 8);
        let range = select_scenarios(&matrix, ScenarioSelection::Range(5, 9), false);
        assert_eq!(
            range.iter().map(|s| s.number).collect::<Vec<_>>(),
            vec![5, 6, 7, 8, 9]
        );
    }

    #[test]
    fn mix_up_flag_only_on_high_scenarios() {
        for scenario in scenario_matrix() {
            let has_flag = scenario.args.iter().any(|a| a == "--mix-up-meals");
            assert_eq!(has_flag, scenario.number >= 7, "scenario {}", scenario.number);
        }
    }

    #[test]
    fn generated_fixture_reparses_into_sequential_plan() {
        let mut rng = StdRng::seed_from_u64(61);
        let text = generate_fixture(50, &mut rng);
        let plan =
            ridecheck_core::build_plan(&text, DuplicatePolicy::Reject).expect("generator output");
        assert_eq!(plan.len(), 50);
        assert_eq!(
            plan.keys().copied().collect::<Vec<_>>(),
            (0..50).collect::<Vec<_>>()
        );
        assert!(plan.values().all(|&requester| requester < 100));
    }

    #[test]
    fn generated_lines_carry_two_coordinate_pairs() {
        let mut rng = StdRng::seed_from_u64(7);
        let text = generate_fixture(5, &mut rng);
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            assert_eq!(fields.len(), 6, "line {line:?}");
            let lat_ok = |f: &str| f.parse::<f64>().map(|v| v.abs() <= 90.0).unwrap_or(false);
            let lon_ok = |f: &str| f.parse::<f64>().map(|v| v.abs() <= 180.0).unwrap_or(false);
            assert!(lat_ok(fields[2]) && lat_ok(fields[4]), "line {line:?}");
            assert!(lon_ok(fields[3]) && lon_ok(fields[5]), "line {line:?}");
        }
    }

    #[test]
    fn debug_artifact_is_overwritten_per_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_debug_artifact(dir.path(), "t1", b"first run").unwrap();
        let second = write_debug_artifact(dir.path(), "t1", b"second run").unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(&second).unwrap(), b"second run");
    }
}
