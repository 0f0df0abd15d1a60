//! Correctness contract for the dispatch exercise.
//!
//! A fixture describes work items as `<requester> <time> <payload...>` lines.
//! The dispatch executable under test is free to complete those items from
//! any thread in any order, but every item must be completed exactly once and
//! attributed to the right requester at the right logical time. This crate
//! derives the expected plan from a fixture, extracts completion events from
//! captured output, and judges whether the observed events are a valid
//! realization of the plan. Which driver served a request is deliberately
//! never checked: the load-balancing choice belongs to the system under test.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use thiserror::Error;

/// Expected-result mapping for one fixture: logical time -> requester identity.
pub type Plan = BTreeMap<u64, u64>;

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("malformed fixture line {line_no}: {line:?} (expected `<requester> <time> ...`)")]
    MalformedLine { line_no: usize, line: String },
    #[error("duplicate logical time {time} on fixture line {line_no}")]
    DuplicateTime { time: u64, line_no: usize },
}

/// What to do when a fixture declares the same logical time twice.
///
/// The fixture format treats logical times as unique identifiers, so a
/// duplicate is almost certainly a broken fixture. `LastWins` preserves the
/// historical behavior of silently overwriting; `Reject` makes it a hard
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    #[default]
    LastWins,
    Reject,
}

/// One completion event extracted from captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedEvent {
    pub handler: u64,
    pub requester: u64,
    pub time: u64,
}

/// Outcome of checking observed events against a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// Missing, duplicated, or extra completions.
    CountMismatch { expected: usize, observed: usize },
    /// An event's logical time is unknown or mapped to a different requester.
    WrongAssignment {
        time: u64,
        expected: Option<u64>,
        observed: u64,
    },
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }
}

fn record_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s+(\d+)(?:\s|$)").expect("static pattern"))
}

fn event_pattern() -> &'static BytesRegex {
    static RE: OnceLock<BytesRegex> = OnceLock::new();
    RE.get_or_init(|| {
        BytesRegex::new(r"Driver (\d+): Responding to customer (\d+) at time (\d+)")
            .expect("static pattern")
    })
}

/// Builds the expected plan from fixture text.
///
/// Every line must begin with two non-negative integers; trailing payload
/// fields (coordinates) are ignored here but fed to the executable verbatim
/// by the caller.
pub fn build_plan(text: &str, policy: DuplicatePolicy) -> Result<Plan, FixtureError> {
    let mut plan = Plan::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let caps =
            record_pattern()
                .captures(line)
                .ok_or_else(|| FixtureError::MalformedLine {
                    line_no,
                    line: line.to_string(),
                })?;
        let requester = parse_field(&caps[1], line_no, line)?;
        let time = parse_field(&caps[2], line_no, line)?;
        if policy == DuplicatePolicy::Reject && plan.contains_key(&time) {
            return Err(FixtureError::DuplicateTime { time, line_no });
        }
        plan.insert(time, requester);
    }
    Ok(plan)
}

fn parse_field(digits: &str, line_no: usize, line: &str) -> Result<u64, FixtureError> {
    digits.parse().map_err(|_| FixtureError::MalformedLine {
        line_no,
        line: line.to_string(),
    })
}

/// Scans captured output for completion events.
///
/// The scan runs over raw bytes because a crashing executable can emit
/// arbitrary garbage around the lines we care about. Non-matching text is
/// ignored, and no ordering is assumed: concurrent drivers finish work in
/// whatever order the scheduler gives them.
pub fn parse_events(output: &[u8]) -> Vec<ObservedEvent> {
    event_pattern()
        .captures_iter(output)
        .filter_map(|caps| {
            Some(ObservedEvent {
                handler: ascii_u64(&caps[1])?,
                requester: ascii_u64(&caps[2])?,
                time: ascii_u64(&caps[3])?,
            })
        })
        .collect()
}

fn ascii_u64(digits: &[u8]) -> Option<u64> {
    // The pattern only matches ASCII digits; this fails only on overflow,
    // and a number that large cannot correspond to any fixture record.
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Decides whether the observed events are a valid realization of the plan.
///
/// Cardinality is checked first: with unique logical times in the plan, an
/// equal count plus a correct mapping per event implies every item was
/// completed exactly once. The handler field is never consulted.
pub fn validate(plan: &Plan, events: &[ObservedEvent]) -> Verdict {
    if events.len() != plan.len() {
        return Verdict::CountMismatch {
            expected: plan.len(),
            observed: events.len(),
        };
    }
    for event in events {
        match plan.get(&event.time) {
            Some(&requester) if requester == event.requester => {}
            expected => {
                return Verdict::WrongAssignment {
                    time: event.time,
                    expected: expected.copied(),
                    observed: event.requester,
                };
            }
        }
    }
    Verdict::Valid
}

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = "3 0 10.00 20.00 30.00 40.00\n7 1 -5.00 -5.00 5.00 5.00\n";

    fn fixture_plan() -> Plan {
        build_plan(FIXTURE, DuplicatePolicy::LastWins).expect("fixture parses")
    }

    #[test]
    fn plan_maps_time_to_requester() {
        let plan = fixture_plan();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.get(&0), Some(&3));
        assert_eq!(plan.get(&1), Some(&7));
    }

    #[test]
    fn plan_accepts_records_without_payload() {
        let plan = build_plan("12 4\n", DuplicatePolicy::Reject).expect("bare record parses");
        assert_eq!(plan.get(&4), Some(&12));
    }

    #[test]
    fn empty_fixture_yields_empty_plan() {
        let plan = build_plan("", DuplicatePolicy::Reject).expect("empty fixture parses");
        assert!(plan.is_empty());
        assert!(validate(&plan, &[]).is_valid());
    }

    #[test]
    fn malformed_line_is_reported_with_its_number() {
        let err = build_plan("3 0 1.0 1.0 1.0 1.0\nnot a record\n", DuplicatePolicy::LastWins)
            .expect_err("second line is malformed");
        match err {
            FixtureError::MalformedLine { line_no, line } => {
                assert_eq!(line_no, 2);
                assert_eq!(line, "not a record");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn blank_interior_line_is_malformed() {
        assert!(build_plan("3 0\n\n7 1\n", DuplicatePolicy::LastWins).is_err());
    }

    #[test]
    fn duplicate_time_last_writer_wins_by_default() {
        let plan = build_plan("3 0\n9 0\n", DuplicatePolicy::LastWins).expect("duplicates allowed");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.get(&0), Some(&9));
    }

    #[test]
    fn duplicate_time_rejected_in_strict_mode() {
        let err = build_plan("3 0\n9 0\n", DuplicatePolicy::Reject)
            .expect_err("duplicates rejected");
        match err {
            FixtureError::DuplicateTime { time, line_no } => {
                assert_eq!(time, 0);
                assert_eq!(line_no, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parser_ignores_interleaved_noise() {
        let output = b"starting up\n\
            Driver 2: Responding to customer 7 at time 1\n\
            [debug] queue depth 3\n\
            Driver 9: Responding to customer 3 at time 0\n\
            done\n";
        let events = parse_events(output);
        assert_eq!(
            events,
            vec![
                ObservedEvent { handler: 2, requester: 7, time: 1 },
                ObservedEvent { handler: 9, requester: 3, time: 0 },
            ]
        );
    }

    #[test]
    fn parser_tolerates_non_utf8_bytes() {
        let mut output = vec![0xff, 0xfe, b'\n'];
        output.extend_from_slice(b"Driver 1: Responding to customer 3 at time 0\n");
        output.push(0x80);
        assert_eq!(parse_events(&output).len(), 1);
    }

    #[test]
    fn valid_realization_in_any_order() {
        let plan = fixture_plan();
        let forward = parse_events(
            b"Driver 9: Responding to customer 3 at time 0\n\
              Driver 2: Responding to customer 7 at time 1\n",
        );
        let reversed = parse_events(
            b"Driver 2: Responding to customer 7 at time 1\n\
              Driver 9: Responding to customer 3 at time 0\n",
        );
        assert!(validate(&plan, &forward).is_valid());
        assert!(validate(&plan, &reversed).is_valid());
    }

    #[test]
    fn missing_event_fails_on_cardinality() {
        let plan = fixture_plan();
        let events = parse_events(b"Driver 9: Responding to customer 3 at time 0\n");
        assert_eq!(
            validate(&plan, &events),
            Verdict::CountMismatch { expected: 2, observed: 1 }
        );
    }

    #[test]
    fn duplicated_completion_fails_on_cardinality() {
        let plan = fixture_plan();
        let events = parse_events(
            b"Driver 9: Responding to customer 3 at time 0\n\
              Driver 4: Responding to customer 3 at time 0\n\
              Driver 2: Responding to customer 7 at time 1\n",
        );
        assert!(matches!(
            validate(&plan, &events),
            Verdict::CountMismatch { expected: 2, observed: 3 }
        ));
    }

    #[test]
    fn wrong_requester_at_time_fails() {
        let plan = fixture_plan();
        let events = parse_events(
            b"Driver 9: Responding to customer 3 at time 0\n\
              Driver 2: Responding to customer 3 at time 1\n",
        );
        assert_eq!(
            validate(&plan, &events),
            Verdict::WrongAssignment { time: 1, expected: Some(7), observed: 3 }
        );
    }

    #[test]
    fn unknown_time_fails() {
        let plan = fixture_plan();
        let events = parse_events(
            b"Driver 9: Responding to customer 3 at time 0\n\
              Driver 2: Responding to customer 7 at time 5\n",
        );
        assert_eq!(
            validate(&plan, &events),
            Verdict::WrongAssignment { time: 5, expected: None, observed: 7 }
        );
    }

    #[test]
    fn handler_identity_never_affects_the_verdict() {
        let plan = fixture_plan();
        let served_by_one = parse_events(
            b"Driver 0: Responding to customer 3 at time 0\n\
              Driver 0: Responding to customer 7 at time 1\n",
        );
        let served_by_many = parse_events(
            b"Driver 41: Responding to customer 3 at time 0\n\
              Driver 7: Responding to customer 7 at time 1\n",
        );
        assert_eq!(validate(&plan, &served_by_one), validate(&plan, &served_by_many));
        assert!(validate(&plan, &served_by_one).is_valid());
    }
}
