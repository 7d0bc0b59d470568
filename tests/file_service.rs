use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use object_uploader::{
    backend::{BackendError, Fault, MemoryBackend, memory::Call},
    config::TransferConfig,
    errors::TransferError,
    models::{ByteStream, ObjectKey, UploadRequest},
    services::{
        FileService,
        archive::BundleEntry,
        part_planner::{PartPlanner, Strategy},
        validation::ValidationGate,
    },
};
use std::{io, sync::Arc, time::Duration};

const BUCKET: &str = "uploads";
const THRESHOLD: u64 = 64 * 1024;

fn small_parts() -> TransferConfig {
    TransferConfig {
        multipart_threshold_bytes: THRESHOLD,
        target_part_size_bytes: 16 * 1024,
        min_part_size_bytes: 16 * 1024,
        max_concurrent_parts: 4,
        max_part_attempts: 3,
        retry_backoff: Duration::ZERO,
    }
}

fn service_with(backend: Arc<MemoryBackend>, transfer: TransferConfig) -> FileService {
    FileService::new(
        backend,
        BUCKET,
        transfer,
        Arc::new(ValidationGate::new(["virus", ".exe"])),
        1000,
    )
    .unwrap()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

fn source(data: Vec<u8>, chunk: usize) -> ByteStream<'static> {
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(chunk.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks).boxed()
}

async fn download_all(files: &FileService, key: &ObjectKey) -> Vec<u8> {
    let download = files.download(key.as_str()).await.unwrap();
    let chunks: Vec<Bytes> = download.body.try_collect().await.unwrap();
    chunks.concat()
}

async fn listed(files: &FileService) -> Vec<ObjectKey> {
    files.list().try_collect().await.unwrap()
}

#[tokio::test]
async fn round_trip_across_size_boundaries() {
    let backend = Arc::new(MemoryBackend::new());
    let files = service_with(backend.clone(), small_parts());
    let threshold = THRESHOLD as usize;

    for size in [1, threshold, threshold + 1, 5 * threshold + 123] {
        let data = payload(size);
        let request = UploadRequest::new("blob.bin", source(data.clone(), 7_000))
            .with_declared_size(size as u64);
        let key = files.upload(request).await.unwrap();
        assert_eq!(download_all(&files, &key).await, data, "size {}", size);
    }

    let puts = backend
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::PutObject { .. }))
        .count();
    assert_eq!(puts, 2, "only the sizes up to the threshold go single-shot");
    assert_eq!(listed(&files).await.len(), 4);
}

#[tokio::test]
async fn zero_byte_upload_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let files = service_with(backend.clone(), small_parts());

    let err = files
        .upload(UploadRequest::new("empty.txt", source(Vec::new(), 1)).with_declared_size(0))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::ValidationRejected(_)));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn small_report_is_single_shot_and_listed() {
    let backend = Arc::new(MemoryBackend::new());
    let files = service_with(
        backend.clone(),
        TransferConfig {
            multipart_threshold_bytes: 1024 * 1024,
            ..TransferConfig::default()
        },
    );

    let key = files
        .upload(
            UploadRequest::new("report.pdf", source(payload(10), 10))
                .with_declared_size(10)
                .with_content_type("application/pdf"),
        )
        .await
        .unwrap();

    let (timestamp, name) = key.as_str().split_once('_').unwrap();
    assert!(timestamp.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(name, "report.pdf");
    assert!(matches!(backend.calls()[0], Call::PutObject { len: 10, .. }));
    assert!(listed(&files).await.contains(&key));
}

#[tokio::test]
async fn denylisted_name_is_rejected_before_any_backend_call() {
    let backend = Arc::new(MemoryBackend::new());
    let files = service_with(backend.clone(), small_parts());

    let err = files
        .upload(UploadRequest::new("payload_virus.bin", source(payload(10), 10)))
        .await
        .unwrap_err();
    match err {
        TransferError::ValidationRejected(reason) => assert!(reason.contains("virus")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(backend.calls().is_empty());
}

#[test]
fn two_hundred_fifty_mib_plans_fifty_parts() {
    const MIB: u64 = 1024 * 1024;
    let planner = PartPlanner::new(&TransferConfig {
        multipart_threshold_bytes: 5 * MIB,
        target_part_size_bytes: 5 * MIB,
        min_part_size_bytes: 5 * MIB,
        ..TransferConfig::default()
    });
    match planner.plan(Some(250 * MIB)) {
        Strategy::Multipart(plan) => {
            assert_eq!(plan.part_count(), Some(50));
            let total: u64 = plan.parts().iter().map(|p| p.byte_length).sum();
            assert_eq!(total, 250 * MIB);
        }
        Strategy::SingleShot => panic!("expected multipart"),
    }
}

#[tokio::test]
async fn part_failing_twice_still_completes_with_ordered_parts() {
    let backend = Arc::new(MemoryBackend::new().with_part_delay(Duration::from_millis(1)));
    backend.inject(Fault::Part {
        part_number: 37,
        error: BackendError::Transient("503 service unavailable".into()),
        times: Some(2),
    });
    let part = 16 * 1024;
    let files = service_with(
        backend.clone(),
        TransferConfig {
            multipart_threshold_bytes: part as u64,
            ..small_parts()
        },
    );

    let data = payload(50 * part);
    let key = files
        .upload(
            UploadRequest::new("big.bin", source(data.clone(), 10_000))
                .with_declared_size(data.len() as u64),
        )
        .await
        .unwrap();

    let completes: Vec<Vec<u32>> = backend
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Complete { part_numbers, .. } => Some(part_numbers),
            _ => None,
        })
        .collect();
    assert_eq!(completes, vec![(1..=50).collect::<Vec<u32>>()]);
    assert_eq!(download_all(&files, &key).await, data);
}

#[tokio::test]
async fn failed_part_leaves_nothing_listable() {
    let backend = Arc::new(MemoryBackend::new());
    backend.inject(Fault::Part {
        part_number: 3,
        error: BackendError::Transient("connection reset".into()),
        times: None,
    });
    let files = service_with(backend.clone(), small_parts());

    let err = files
        .upload(UploadRequest::new("doomed.bin", source(payload(200_000), 8192)))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::PermanentBackend(_)));
    assert!(listed(&files).await.is_empty());
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn deleting_twice_succeeds() {
    let backend = Arc::new(MemoryBackend::new());
    let files = service_with(backend, small_parts());

    let key = files
        .upload(UploadRequest::new("temp.txt", source(payload(5), 5)))
        .await
        .unwrap();
    files.delete(key.as_str()).await.unwrap();
    files.delete(key.as_str()).await.unwrap();

    let err = files.download(key.as_str()).await.unwrap_err();
    assert!(matches!(err, TransferError::NotFound(_)));
}

#[tokio::test]
async fn bundle_keeps_duplicate_names_in_order() {
    let backend = Arc::new(MemoryBackend::new());
    let files = service_with(backend, small_parts());

    let key = files
        .bundle_and_upload(
            "three.zip",
            vec![
                BundleEntry::new("a.txt", source(b"first".to_vec(), 2)),
                BundleEntry::new("b.txt", source(b"second".to_vec(), 2)),
                BundleEntry::new("a.txt", source(b"third".to_vec(), 2)),
            ],
        )
        .await
        .unwrap();

    let zip = download_all(&files, &key).await;
    let names = central_directory_names(&zip);
    assert_eq!(names, vec!["a.txt", "b.txt", "a.txt"]);
}

/// Entry names in central directory order.
fn central_directory_names(zip: &[u8]) -> Vec<String> {
    let u16_at = |at: usize| u16::from_le_bytes([zip[at], zip[at + 1]]) as usize;
    let u32_at =
        |at: usize| u32::from_le_bytes([zip[at], zip[at + 1], zip[at + 2], zip[at + 3]]) as usize;

    let eocd = zip.len() - 22;
    let count = u16_at(eocd + 10);
    let mut at = u32_at(eocd + 16);
    let mut names = Vec::new();
    for _ in 0..count {
        let name_len = u16_at(at + 28);
        names.push(String::from_utf8(zip[at + 46..at + 46 + name_len].to_vec()).unwrap());
        at += 46 + name_len + u16_at(at + 30) + u16_at(at + 32);
    }
    names
}

#[tokio::test]
async fn independent_transfers_run_in_parallel() {
    let backend = Arc::new(MemoryBackend::new().with_part_delay(Duration::from_millis(2)));
    let files = service_with(backend.clone(), small_parts());

    let uploads = (0..4).map(|i| {
        let files = files.clone();
        tokio::spawn(async move {
            let data = payload(100_000 + i);
            let key = files
                .upload(UploadRequest::new(format!("file-{}.bin", i), source(data.clone(), 4096)))
                .await
                .unwrap();
            (key, data)
        })
    });
    let results = futures::future::join_all(uploads).await;

    for result in results {
        let (key, data) = result.unwrap();
        assert_eq!(download_all(&files, &key).await, data);
    }
    assert_eq!(listed(&files).await.len(), 4);
}
