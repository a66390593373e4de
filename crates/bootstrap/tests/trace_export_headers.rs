//! Trace export against a local OTLP collector that records request metadata.

use std::net::SocketAddr;
use std::time::Duration;

use bootstrap::traces::{API_KEY_HEADER, DATASET_HEADER};
use bootstrap::{
    build_trace_pipeline, connect, BackoffPolicy, CollectorAuth, PipelineShutdown, RetryLimit,
    TelemetryRegistry, TracePipelineConfig,
};
use common::ResourceDescriptor;
use opentelemetry::trace::{Span as _, Tracer as _};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::{
    TraceService, TraceServiceServer,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};

/// Answers every export and forwards its metadata.
struct RecordingCollector {
    exports: mpsc::UnboundedSender<MetadataMap>,
}

#[tonic::async_trait]
impl TraceService for RecordingCollector {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let _ = self.exports.send(request.metadata().clone());
        Ok(Response::new(ExportTraceServiceResponse::default()))
    }
}

async fn start_collector() -> (SocketAddr, mpsc::UnboundedReceiver<MetadataMap>, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (exports, received) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();

    let signal = stop.clone();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(TraceServiceServer::new(RecordingCollector { exports }))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal.cancelled_owned())
            .await
            .unwrap();
    });
    (addr, received, stop)
}

/// Connect, export a single span, and return the metadata the collector saw.
async fn export_one_span(auth: Option<CollectorAuth>) -> MetadataMap {
    let (addr, mut received, stop) = start_collector().await;
    let policy = BackoffPolicy::default()
        .with_base_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_millis(100))
        .with_connect_timeout(Duration::from_secs(2))
        .with_limit(RetryLimit::MaxAttempts(20));
    let connection = connect(&CancellationToken::new(), &addr.to_string(), &[], policy)
        .await
        .unwrap();

    let mut config = TracePipelineConfig::new(ResourceDescriptor::new("header-test"));
    if let Some(auth) = auth {
        config = config.with_auth(auth);
    }
    let registry = TelemetryRegistry::new();
    let pipeline = build_trace_pipeline(&connection, &config, &registry).unwrap();

    registry.tracer("header-test").start("op").end();
    pipeline.force_flush(Duration::from_secs(5)).await.unwrap();
    let metadata = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("collector saw no export")
        .unwrap();

    pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
    connection.close().unwrap();
    stop.cancel();
    metadata
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_headers_arrive_with_the_export() {
    let metadata = export_one_span(Some(CollectorAuth::new("team-key", "spans"))).await;

    assert_eq!(metadata.get(API_KEY_HEADER).unwrap().to_str().unwrap(), "team-key");
    assert_eq!(metadata.get(DATASET_HEADER).unwrap().to_str().unwrap(), "spans");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_auth_sends_no_honeycomb_headers() {
    let metadata = export_one_span(None).await;

    assert!(metadata.get(API_KEY_HEADER).is_none());
    assert!(metadata.get(DATASET_HEADER).is_none());
}
