//! Prometheus text exposition and health endpoint

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use radosproxy_adaptor::ServerAdaptor;
use radosproxy_common::PoolUsageInfo;
use radosproxy_core::{Proxy, ProxyState};
use std::fmt::Write;
use std::sync::Arc;

#[derive(Clone)]
pub struct MetricsState {
    pub proxy: Arc<Proxy>,
    pub adaptor: Arc<ServerAdaptor>,
}

pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        render_metrics(&state.proxy, &state.adaptor),
    )
}

async fn health_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.proxy.state() {
        ProxyState::Active => (StatusCode::OK, "OK".to_string()),
        other => (StatusCode::SERVICE_UNAVAILABLE, other.to_string()),
    }
}

fn gauge(output: &mut String, name: &str, help: &str) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
}

/// Render every exported series
pub fn render_metrics(proxy: &Proxy, adaptor: &ServerAdaptor) -> String {
    let mut out = String::with_capacity(4096);

    adaptor
        .stats()
        .export_prometheus(&mut out, "radosproxy_sa", "adaptor");
    proxy
        .worker_stats()
        .export_prometheus(&mut out, "radosproxy_proxy", "proxy");

    gauge(&mut out, "radosproxy_queue_depth", "Items waiting per worker queue");
    for (pool, depths) in [("adaptor", adaptor.queue_depths()), ("proxy", proxy.queue_depths())] {
        for (queue, depth) in depths.iter().enumerate() {
            let _ = writeln!(
                out,
                "radosproxy_queue_depth{{pool=\"{pool}\",queue=\"{queue}\"}} {depth}"
            );
        }
    }

    gauge(&mut out, "radosproxy_proxy_state", "0 initing, 1 active, 2 down");
    let _ = writeln!(out, "radosproxy_proxy_state {}", proxy.state() as u8);

    gauge(&mut out, "radosproxy_ioctx_cached", "Cached pool contexts");
    let _ = writeln!(out, "radosproxy_ioctx_cached {}", proxy.cached_pools());

    let usage: Vec<_> = proxy
        .tracked_pools()
        .into_iter()
        .filter_map(|id| proxy.pool_usage(id).ok().map(|u| (id, u)))
        .collect();
    if !usage.is_empty() {
        let series: [(&str, &str, fn(&PoolUsageInfo) -> String); 5] = [
            ("stored_bytes", "Logical bytes stored", |u| u.stored_size.to_string()),
            ("objects", "Objects in the pool", |u| u.objects.to_string()),
            ("used_bytes", "Raw bytes used", |u| u.used_size.to_string()),
            ("max_avail_bytes", "Bytes still available to the pool", |u| u.max_avail.to_string()),
            ("use_ratio", "Used fraction of capacity", |u| u.use_ratio.to_string()),
        ];
        for (name, help, value) in series {
            let metric = format!("radosproxy_pool_{name}");
            gauge(&mut out, &metric, help);
            for (id, u) in &usage {
                let _ = writeln!(out, "{metric}{{pool_id=\"{id}\"}} {}", value(u));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ProxyOpHandler;
    use radosproxy_adaptor::AdaptorConfig;
    use radosproxy_cluster::MemCluster;
    use radosproxy_common::ProxyConfig;

    fn setup(monitor: bool) -> MetricsState {
        let cluster = Arc::new(MemCluster::new());
        cluster.create_pool("rbd", 3).unwrap();
        let mut config = ProxyConfig::default();
        config.monitor.enabled = monitor;
        config.cluster.connect_retries = 1;
        let proxy = Proxy::init(&config, cluster).unwrap();
        let adaptor_config = AdaptorConfig {
            queues: 2,
            capacity: 8,
            cores: Vec::new(),
            perf_interval: None,
        };
        let adaptor = Arc::new(
            ServerAdaptor::start(&adaptor_config, Arc::new(ProxyOpHandler::new(proxy.clone())))
                .unwrap(),
        );
        MetricsState { proxy, adaptor }
    }

    #[test]
    fn test_render_includes_both_pools_and_usage() {
        let state = setup(true);
        let text = render_metrics(&state.proxy, &state.adaptor);
        assert!(text.contains("radosproxy_sa_enqueued_total{pool=\"adaptor\"} 0"));
        assert!(text.contains("radosproxy_proxy_processed_total{pool=\"proxy\"} 0"));
        assert!(text.contains("radosproxy_queue_depth{pool=\"adaptor\",queue=\"1\"} 0"));
        assert!(text.contains("radosproxy_proxy_state 1"));
        assert!(text.contains("radosproxy_pool_objects{pool_id=\"1\"} 0"));
        state.adaptor.stop();
        state.proxy.shutdown();
    }

    #[test]
    fn test_render_without_monitor_skips_usage() {
        let state = setup(false);
        let text = render_metrics(&state.proxy, &state.adaptor);
        assert!(!text.contains("radosproxy_pool_"));
        state.adaptor.stop();
        state.proxy.shutdown();
    }

    #[tokio::test]
    async fn test_health_follows_proxy_state() {
        let state = setup(false);
        let resp = health_handler(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        state.proxy.shutdown();
        let resp = health_handler(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        state.adaptor.stop();
    }
}
