use std::collections::HashMap;

use barrage::task::FakeTask;
use barrage::{Scenario, TaskRegistry};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut registry = TaskRegistry::new();
    registry.register(FakeTask::registration());

    // Anything not recognized as a run option goes to the tasks
    let params: HashMap<String, String> = [
        ("duration", "20s"),
        ("concurrency", "4"),
        ("warmup", "5s"),
        ("permits", "500"),
        ("minWait", "2"),
        ("maxWait", "12"),
        ("recoverable-probability", "0.02"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let summary = Scenario::from_registry("fake", &registry, ["fake"], params)
        .unwrap()
        .run()
        .await
        .unwrap();

    println!("{}", serde_json::to_string_pretty(&summary).unwrap());
}
