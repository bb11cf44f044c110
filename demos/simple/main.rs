use std::time::Duration;

use unleash_client::{ClientConfig, Context, MemoryMetrics, Settings};

pub fn main() {
    env_logger::init();

    let settings = Settings::from_env();
    let client = ClientConfig::from_settings(settings)
        .metrics(MemoryMetrics::new())
        .to_client()
        .unwrap();

    // Report evaluation counts every minute.
    let metrics = client.start_metrics_thread(Duration::from_secs(60)).unwrap();

    let context = Context::new().with("userId", "test-user");

    // Features are fetched on the first evaluation and refreshed once they get stale. Until data
    // is available from the server, the shared cache or the backup, evaluation fails and the
    // default is used.
    let enabled = client
        .is_enabled("new-checkout", &context, false)
        // default value
        .unwrap_or(false);

    println!("new-checkout enabled: {:?}", enabled);

    if let Some(metrics) = metrics {
        metrics.shutdown().unwrap();
    }
}
