use serde::Serialize;

use telemetry_aggregator::LivenessEvent;
use types::Snapshot;

/// One JSON document per stdout line, tagged with `kind`.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OutputLine<'a> {
    Snapshot(&'a Snapshot),
    Liveness(&'a LivenessEvent),
}

pub fn snapshot_line(snapshot: &Snapshot) -> serde_json::Result<String> {
    serde_json::to_string(&OutputLine::Snapshot(snapshot))
}

pub fn event_line(event: &LivenessEvent) -> serde_json::Result<String> {
    serde_json::to_string(&OutputLine::Liveness(event))
}
