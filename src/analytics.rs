//! Task performance derived from the event log. Nothing here writes; running
//! an analysis twice over the same log gives the same output.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::database::{Event, EventData, EventKind, Interface, Submission};

/// Which attempts count toward reformulations.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub(crate) enum ReformulationPolicy {
    /// Natural-language queries only.
    #[default]
    NlQueries,
    /// Natural-language queries, manual filter changes and confirmations.
    AllAttempts,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub(crate) struct TaskKey {
    pub(crate) participant_id: String,
    pub(crate) task_id: String,
    pub(crate) interface: Interface,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct AttemptCounts {
    pub(crate) nl_queries: usize,
    pub(crate) filter_changes: usize,
    pub(crate) confirmations: usize,
}

impl AttemptCounts {
    fn total(&self, policy: ReformulationPolicy) -> usize {
        match policy {
            ReformulationPolicy::NlQueries => self.nl_queries,
            ReformulationPolicy::AllAttempts => {
                self.nl_queries + self.filter_changes + self.confirmations
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct TaskPerformance {
    #[serde(flatten)]
    pub(crate) key: TaskKey,
    /// `None` when no start precedes the completion.
    pub(crate) duration_seconds: Option<f64>,
    pub(crate) submission: Submission,
    pub(crate) selected_movie_count: usize,
    pub(crate) reformulations: usize,
    pub(crate) attempts: AttemptCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct InterfaceSummary {
    pub(crate) interface: Interface,
    pub(crate) completed_tasks: usize,
    pub(crate) timed_tasks: usize,
    pub(crate) mean_duration_seconds: Option<f64>,
    pub(crate) mean_reformulations: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Analysis {
    pub(crate) records: Vec<TaskPerformance>,
    /// Tasks that were started but never completed.
    pub(crate) abandoned: Vec<TaskKey>,
    pub(crate) summary: Vec<InterfaceSummary>,
}

#[derive(Default)]
struct TaskLog<'a> {
    started: Option<(DateTime<Utc>, u64)>,
    completed: Option<(DateTime<Utc>, u64, &'a EventData)>,
    attempts: AttemptCounts,
}

/// Builds one record per completed task key, pairing the earliest start with
/// the latest completion.
pub(crate) fn analyze(events: &[Event], policy: ReformulationPolicy) -> Analysis {
    let mut tasks: BTreeMap<TaskKey, TaskLog> = BTreeMap::new();
    for event in events {
        let Some(task_id) = &event.task_id else {
            continue;
        };
        let key = TaskKey {
            participant_id: event.participant_id.clone(),
            task_id: task_id.clone(),
            interface: event.interface,
        };
        let task = tasks.entry(key).or_default();
        let at = (event.timestamp, event.id);
        match event.kind() {
            EventKind::TaskStarted => {
                if task.started.is_none_or(|started| at < started) {
                    task.started = Some(at);
                }
            }
            EventKind::TaskCompleted => {
                if task
                    .completed
                    .is_none_or(|(timestamp, id, _)| at >= (timestamp, id))
                {
                    task.completed = Some((at.0, at.1, &event.data));
                }
            }
            EventKind::NlQuerySent => task.attempts.nl_queries += 1,
            EventKind::FilterChange => task.attempts.filter_changes += 1,
            EventKind::QueryConfirmed => task.attempts.confirmations += 1,
            _ => {}
        }
    }

    let mut records = Vec::new();
    let mut abandoned = Vec::new();
    for (key, task) in tasks {
        let Some((completed_at, completed_id, data)) = task.completed else {
            if task.started.is_some() {
                abandoned.push(key);
            }
            continue;
        };
        let duration_seconds = task
            .started
            .filter(|started| *started <= (completed_at, completed_id))
            .and_then(|(started_at, _)| seconds_between(started_at, completed_at));
        if duration_seconds.is_none() {
            debug!(
                participant = %key.participant_id,
                task = %key.task_id,
                "completed task has no preceding start"
            );
        }
        let submission = submission(data);
        records.push(TaskPerformance {
            key,
            duration_seconds,
            selected_movie_count: submission.selected_movie_ids.len(),
            submission,
            reformulations: task.attempts.total(policy).saturating_sub(1),
            attempts: task.attempts,
        });
    }

    let summary = summarize(&records);
    Analysis {
        records,
        abandoned,
        summary,
    }
}

/// The submission carried by a completion. A payload that does not decode
/// as a submission is kept under `extra` with no selected ids.
fn submission(data: &EventData) -> Submission {
    match data {
        EventData::TaskCompleted(submission) => submission.clone(),
        EventData::Other { payload, .. } => {
            let extra = match payload {
                Value::Object(fields) => fields.clone(),
                Value::Null => Map::new(),
                other => Map::from_iter([("payload".to_string(), other.clone())]),
            };
            Submission {
                selected_movie_ids: Vec::new(),
                extra,
            }
        }
        _ => Submission::default(),
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
    let micros = (end - start).num_microseconds()?;
    Some(micros.to_f64()? / 1_000_000.0)
}

fn summarize(records: &[TaskPerformance]) -> Vec<InterfaceSummary> {
    let mut by_interface: BTreeMap<Interface, Vec<&TaskPerformance>> = BTreeMap::new();
    for record in records {
        by_interface
            .entry(record.key.interface)
            .or_default()
            .push(record);
    }
    by_interface
        .into_iter()
        .map(|(interface, records)| {
            let durations: Vec<f64> = records.iter().filter_map(|r| r.duration_seconds).collect();
            let reformulations: Vec<f64> = records
                .iter()
                .filter_map(|r| r.reformulations.to_f64())
                .collect();
            InterfaceSummary {
                interface,
                completed_tasks: records.len(),
                timed_tasks: durations.len(),
                mean_duration_seconds: mean(&durations),
                mean_reformulations: mean(&reformulations),
            }
        })
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len().to_f64()?)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;
    use crate::database::{EventFilter, NlQuery, TestDatabase};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    struct Log {
        test: TestDatabase,
    }

    impl Log {
        fn new() -> Self {
            Self {
                test: TestDatabase::new(),
            }
        }

        fn push(&self, task: &str, interface: Interface, secs: i64, data: EventData) {
            self.test
                .db
                .append_event(
                    Event::new("p1", interface, Some(task), data)
                        .at(base() + Duration::seconds(secs)),
                )
                .unwrap();
        }

        fn query(&self, task: &str, interface: Interface, secs: i64) {
            self.push(
                task,
                interface,
                secs,
                EventData::NlQuerySent(NlQuery {
                    query: "dramas".to_string(),
                }),
            );
        }

        fn events(&self) -> Vec<Event> {
            self.test.db.events(&EventFilter::default()).unwrap()
        }
    }

    fn completed(ids: &[u64]) -> EventData {
        EventData::TaskCompleted(
            serde_json::from_value(json!({ "selected_movie_ids": ids })).unwrap(),
        )
    }

    #[test]
    fn reformulations_count_queries_beyond_the_first() {
        let log = Log::new();
        for (task, queries) in [("t0", 0), ("t1", 1), ("t4", 4)] {
            log.push(task, Interface::LlmOnly, 0, EventData::TaskStarted);
            for i in 0..queries {
                log.query(task, Interface::LlmOnly, 1 + i);
            }
            log.push(task, Interface::LlmOnly, 30, completed(&[]));
        }

        let analysis = analyze(&log.events(), ReformulationPolicy::NlQueries);
        let counts: Vec<(String, usize)> = analysis
            .records
            .iter()
            .map(|r| (r.key.task_id.clone(), r.reformulations))
            .collect();
        assert_eq!(
            counts,
            vec![("t0".into(), 0), ("t1".into(), 0), ("t4".into(), 3)]
        );
    }

    #[test]
    fn duration_is_exact_seconds() {
        let log = Log::new();
        log.push("t1", Interface::Faceted, 0, EventData::TaskStarted);
        log.push("t1", Interface::Faceted, 42, completed(&[3, 5]));

        let analysis = analyze(&log.events(), ReformulationPolicy::default());
        assert_eq!(analysis.records.len(), 1);
        assert_eq!(analysis.records[0].duration_seconds, Some(42.0));
        assert_eq!(analysis.records[0].selected_movie_count, 2);
        assert_eq!(analysis.summary[0].mean_duration_seconds, Some(42.0));
    }

    #[test]
    fn earliest_start_and_latest_completion_are_paired() {
        let log = Log::new();
        log.push("t1", Interface::Faceted, 10, EventData::TaskStarted);
        log.push("t1", Interface::Faceted, 0, EventData::TaskStarted);
        log.push("t1", Interface::Faceted, 20, completed(&[1]));
        log.push("t1", Interface::Faceted, 50, completed(&[2]));

        let analysis = analyze(&log.events(), ReformulationPolicy::default());
        assert_eq!(analysis.records[0].duration_seconds, Some(50.0));
        assert_eq!(analysis.records[0].submission.selected_movie_ids, vec![2]);
    }

    #[test]
    fn conditions_are_keyed_separately() {
        let log = Log::new();
        log.push("t1", Interface::Faceted, 0, EventData::TaskStarted);
        log.push("t1", Interface::LlmAssist, 5, EventData::TaskStarted);
        log.query("t1", Interface::LlmAssist, 6);
        log.query("t1", Interface::LlmAssist, 7);
        log.push("t1", Interface::Faceted, 20, completed(&[]));
        log.push("t1", Interface::LlmAssist, 45, completed(&[]));

        let analysis = analyze(&log.events(), ReformulationPolicy::default());
        let durations: Vec<_> = analysis
            .records
            .iter()
            .map(|r| (r.key.interface, r.duration_seconds, r.reformulations))
            .collect();
        assert_eq!(
            durations,
            vec![
                (Interface::Faceted, Some(20.0), 0),
                (Interface::LlmAssist, Some(40.0), 1),
            ]
        );
        assert_eq!(analysis.summary.len(), 2);
    }

    #[test]
    fn completion_without_start_has_unknown_duration() {
        let log = Log::new();
        log.push("t1", Interface::LlmOnly, 30, completed(&[]));
        log.push("t2", Interface::LlmOnly, 40, EventData::TaskStarted);
        log.push("t2", Interface::LlmOnly, 10, completed(&[]));
        log.push("t3", Interface::LlmOnly, 0, EventData::TaskStarted);

        let analysis = analyze(&log.events(), ReformulationPolicy::default());
        assert_eq!(analysis.records.len(), 2);
        assert!(analysis.records.iter().all(|r| r.duration_seconds.is_none()));
        assert_eq!(analysis.abandoned.len(), 1);
        assert_eq!(analysis.abandoned[0].task_id, "t3");
        assert_eq!(analysis.summary[0].timed_tasks, 0);
        assert_eq!(analysis.summary[0].mean_duration_seconds, None);
    }

    #[test]
    fn completion_with_untyped_payload_still_counts() {
        let log = Log::new();
        log.push("t1", Interface::Faceted, 0, EventData::TaskStarted);
        log.push(
            "t1",
            Interface::Faceted,
            42,
            EventData::new("task_completed", json!({ "selected_movie_ids": ["7"] })),
        );
        log.push("t2", Interface::Faceted, 50, EventData::TaskStarted);
        log.push(
            "t2",
            Interface::Faceted,
            55,
            EventData::new("task_completed", json!("Lady Bird")),
        );

        let analysis = analyze(&log.events(), ReformulationPolicy::default());
        assert!(analysis.abandoned.is_empty());
        assert_eq!(analysis.records.len(), 2);
        let first = &analysis.records[0];
        assert_eq!(first.duration_seconds, Some(42.0));
        assert_eq!(first.selected_movie_count, 0);
        assert_eq!(first.submission.extra["selected_movie_ids"], json!(["7"]));
        let second = &analysis.records[1];
        assert_eq!(second.duration_seconds, Some(5.0));
        assert_eq!(second.submission.extra["payload"], "Lady Bird");
    }

    #[test]
    fn all_attempts_policy_counts_manual_changes() {
        let log = Log::new();
        log.push("t1", Interface::LlmAssist, 0, EventData::TaskStarted);
        log.query("t1", Interface::LlmAssist, 1);
        log.push(
            "t1",
            Interface::LlmAssist,
            2,
            EventData::new("query_confirmed", json!({ "parsed_query": {} })),
        );
        log.push(
            "t1",
            Interface::LlmAssist,
            3,
            EventData::new("filter_change", json!({ "filters": {} })),
        );
        log.push("t1", Interface::LlmAssist, 9, completed(&[]));

        let events = log.events();
        let narrow = analyze(&events, ReformulationPolicy::NlQueries);
        let wide = analyze(&events, ReformulationPolicy::AllAttempts);
        assert_eq!(narrow.records[0].reformulations, 0);
        assert_eq!(wide.records[0].reformulations, 2);
        assert_eq!(
            wide.records[0].attempts,
            AttemptCounts {
                nl_queries: 1,
                filter_changes: 1,
                confirmations: 1,
            }
        );
    }

    #[test]
    fn events_without_task_are_ignored_and_analysis_is_repeatable() {
        let log = Log::new();
        log.test
            .db
            .append_event(Event::new("p1", Interface::Faceted, None, EventData::TaskStarted))
            .unwrap();
        log.push("t1", Interface::Faceted, 0, EventData::TaskStarted);
        log.push("t1", Interface::Faceted, 5, completed(&[]));

        let events = log.events();
        let first = analyze(&events, ReformulationPolicy::default());
        let second = analyze(&events, ReformulationPolicy::default());
        assert_eq!(first, second);
        assert_eq!(first.records.len(), 1);
        assert!(first.abandoned.is_empty());
    }
}
