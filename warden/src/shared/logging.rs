// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::log_ring::LogRing;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Create environment filter with default to INFO level.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string().to_lowercase()))
}

/// Installs the global `tracing` subscriber: a human readable stderr layer, plus a layer feeding
/// `ring` so the crash report can include the last lines logged before a fault.
///
/// Hosts with their own subscriber skip this and attach the ring themselves with
/// `tracing_subscriber::fmt::layer().with_writer(ring.clone())`.
pub fn init_logging(ring: Option<&LogRing>) -> anyhow::Result<()> {
    let ring_layer = ring.map(|ring| {
        fmt::layer()
            .with_writer(ring.clone())
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(false),
        )
        .with(ring_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::subscriber::with_default;

    #[test]
    fn test_ring_layer_records_events() {
        let ring = LogRing::new(8, 256);
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_writer(ring.clone())
                .with_ansi(false)
                .with_filter(LevelFilter::INFO),
        );

        with_default(subscriber, || {
            tracing::debug!("filtered out");
            tracing::warn!(attempt = 2, "shutdown requested");
        });

        let tail = ring.tail(8);
        assert_eq!(tail.len(), 1);
        assert!(tail[0].contains("WARN"));
        assert!(tail[0].contains("shutdown requested"));
        assert!(tail[0].contains("attempt=2"));
    }
}
