use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use tempfile::TempDir;

use driftbay_engine::{
    ByteStream, Chunk, ListUploadsParams, LocalStore, MultipartEngine, ResumableWriter,
    StoreConfig, sweep_orphans,
};
use driftbay_session::{
    CompletedPart, ObjectChecksums, SessionRegistry, UploadError, UploadStatus, WriteStatus,
};

fn fixture() -> (TempDir, Arc<SessionRegistry>, LocalStore) {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(StoreConfig {
        data_dir: dir.path().join("data"),
        scratch_dir: dir.path().join("scratch"),
    })
    .unwrap();
    (dir, Arc::new(SessionRegistry::new()), store)
}

fn chunk(offset: u64, data: &[u8], finish: bool) -> Chunk {
    Chunk {
        write_offset: offset,
        content: Bytes::copy_from_slice(data),
        crc32c: None,
        finish_write: finish,
    }
}

fn bytes_stream(data: &[u8]) -> ByteStream {
    let owned = Bytes::copy_from_slice(data);
    Box::pin(futures::stream::once(async move {
        Ok::<Bytes, std::io::Error>(owned)
    }))
}

async fn read_object(store: &LocalStore, bucket: &str, key: &str) -> Vec<u8> {
    let mut read = store
        .read_object(bucket, key, None)
        .await
        .unwrap()
        .expect("object should exist");
    let mut out = Vec::new();
    while let Some(buf) = read.stream.try_next().await.unwrap() {
        out.extend_from_slice(&buf);
    }
    out
}

#[tokio::test]
async fn stream_offsets_are_strict() {
    let (_dir, registry, store) = fixture();
    let writer = ResumableWriter::new(Arc::clone(&registry), store);

    let session = writer.open("b", "k").await.unwrap();
    let id = session.upload_id;

    let status = writer.write(&id, chunk(0, &[7u8; 1024], false), None).await.unwrap();
    assert_eq!(status, WriteStatus::Persisted { size: 1024 });

    // Out-of-order offsets are rejected without mutating anything.
    for bad_offset in [0, 500, 2048] {
        let err = writer
            .write(&id, chunk(bad_offset, b"x", false), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidArgument { .. }));
        assert_eq!(
            writer.query_status(&id).unwrap(),
            WriteStatus::Persisted { size: 1024 }
        );
    }

    writer.write(&id, chunk(1024, &[7u8; 100], false), None).await.unwrap();
    assert_eq!(
        writer.query_status(&id).unwrap(),
        WriteStatus::Persisted { size: 1124 }
    );
}

#[tokio::test]
async fn stream_resumes_after_disconnect() {
    let (_dir, registry, store) = fixture();
    let id = {
        let writer = ResumableWriter::new(Arc::clone(&registry), store.clone());
        let session = writer.open("b", "k").await.unwrap();
        writer
            .write(&session.upload_id, chunk(0, &[1u8; 1024], false), None)
            .await
            .unwrap();
        session.upload_id
        // Writer dropped here: the connection (and its rolling state) is gone.
    };

    let writer = ResumableWriter::new(Arc::clone(&registry), store.clone());
    assert_eq!(
        writer.query_status(&id).unwrap(),
        WriteStatus::Persisted { size: 1024 }
    );

    // A bare write without state is refused until the caller resumes.
    let err = writer
        .write(&id, chunk(1024, &[2u8; 512], false), None)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidArgument { .. }));

    let resumed = writer.resume(&id).await.unwrap();
    assert_eq!(resumed.persisted_size, 1024);

    let status = writer
        .write(&id, chunk(1024, &[2u8; 512], true), None)
        .await
        .unwrap();
    let WriteStatus::Resource(resource) = status else {
        panic!("finishing chunk should produce the resource");
    };
    assert_eq!(resource.size, 1536);
    assert_eq!(registry.get(&id).unwrap().status, UploadStatus::Complete);

    let mut expected = vec![1u8; 1024];
    expected.extend_from_slice(&[2u8; 512]);
    assert_eq!(read_object(&store, "b", "k").await, expected);
}

#[tokio::test]
async fn chunk_checksum_mismatch_rejects_the_chunk() {
    let (_dir, registry, store) = fixture();
    let writer = ResumableWriter::new(Arc::clone(&registry), store);
    let id = writer.open("b", "k").await.unwrap().upload_id;

    let mut bad = chunk(0, b"payload", false);
    bad.crc32c = Some(driftbay_checksum::crc32c(b"payload") ^ 1);
    let err = writer.write(&id, bad, None).await.unwrap_err();
    assert!(matches!(err, UploadError::Checksum(_)));
    assert_eq!(writer.query_status(&id).unwrap(), WriteStatus::Persisted { size: 0 });

    // The same bytes with the right checksum are welcome.
    let mut good = chunk(0, b"payload", false);
    good.crc32c = Some(driftbay_checksum::crc32c(b"payload"));
    writer.write(&id, good, None).await.unwrap();
    assert_eq!(writer.query_status(&id).unwrap(), WriteStatus::Persisted { size: 7 });
}

#[tokio::test]
async fn finalize_checksum_mismatch_leaves_session_open() {
    let (_dir, registry, store) = fixture();
    let writer = ResumableWriter::new(Arc::clone(&registry), store);
    let id = writer.open("b", "k").await.unwrap().upload_id;

    writer.write(&id, chunk(0, b"hello", false), None).await.unwrap();

    let wrong = ObjectChecksums {
        crc32c: Some(driftbay_checksum::crc32c(b"helloworld") ^ 1),
        md5_hash: None,
    };
    let err = writer
        .write(&id, chunk(5, b"world", true), Some(wrong))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Checksum(_)));

    // Open, size unchanged, nothing from the rejected chunk persisted.
    let session = registry.get(&id).unwrap();
    assert_eq!(session.status, UploadStatus::Open);
    assert_eq!(session.persisted_size, 5);

    // Re-deriving the checksums and retrying the same finishing chunk works.
    let correct = ObjectChecksums {
        crc32c: Some(driftbay_checksum::crc32c(b"helloworld")),
        md5_hash: Some(driftbay_checksum::md5(b"helloworld").to_vec()),
    };
    let status = writer
        .write(&id, chunk(5, b"world", true), Some(correct))
        .await
        .unwrap();
    let WriteStatus::Resource(resource) = status else {
        panic!("expected resource");
    };
    assert_eq!(resource.crc32c, Some(driftbay_checksum::crc32c(b"helloworld")));
    assert_eq!(resource.etag, driftbay_checksum::md5_hex(b"helloworld"));
}

#[tokio::test]
async fn nothing_follows_the_finishing_chunk() {
    let (_dir, registry, store) = fixture();
    let writer = ResumableWriter::new(Arc::clone(&registry), store);
    let id = writer.open("b", "k").await.unwrap().upload_id;

    writer.write(&id, chunk(0, b"all of it", true), None).await.unwrap();
    let err = writer.write(&id, chunk(9, b"more", false), None).await.unwrap_err();
    assert!(matches!(err, UploadError::InvalidArgument { .. }));
}

#[tokio::test]
async fn aborted_stream_rejects_chunks_and_drops_the_spool() {
    let (_dir, registry, store) = fixture();
    let writer = ResumableWriter::new(Arc::clone(&registry), store);
    let id = writer.open("b", "k").await.unwrap().upload_id;
    writer.write(&id, chunk(0, b"data", false), None).await.unwrap();

    assert_eq!(writer.abort(&id).await.unwrap().status, UploadStatus::Aborted);
    // Aborting again is a no-op, not an error.
    assert_eq!(writer.abort(&id).await.unwrap().status, UploadStatus::Aborted);

    let err = writer.write(&id, chunk(4, b"late", false), None).await.unwrap_err();
    assert!(matches!(err, UploadError::FailedPrecondition { .. }));
    assert!(matches!(
        writer.query_status(&id),
        Err(UploadError::FailedPrecondition { .. })
    ));
}

#[tokio::test]
async fn redirect_routing_state_is_echoed() {
    let (_dir, registry, store) = fixture();
    let writer = ResumableWriter::new(Arc::clone(&registry), store);
    let id = writer.open("b", "k").await.unwrap().upload_id;

    assert_eq!(writer.routing(&id).unwrap(), None);
    writer
        .note_redirect(&id, Some("handle-1".into()), Some("zone-b".into()))
        .unwrap();
    let routing = writer.routing(&id).unwrap().unwrap();
    assert_eq!(routing.write_handle.as_deref(), Some("handle-1"));
    assert_eq!(routing.routing_token.as_deref(), Some("zone-b"));

    // Advisory only: persisted size is untouched.
    assert_eq!(writer.query_status(&id).unwrap(), WriteStatus::Persisted { size: 0 });
}

#[tokio::test]
async fn multipart_round_trip() {
    let (_dir, registry, store) = fixture();
    let engine = MultipartEngine::new(Arc::clone(&registry), store.clone());

    let id = engine.create("b", "k").await.unwrap().upload_id;
    let p1 = engine
        .upload_part(&id, 1, bytes_stream(&[0xa1; 64]), None)
        .await
        .unwrap();
    let p2 = engine
        .upload_part(&id, 2, bytes_stream(&[0xb2; 32]), None)
        .await
        .unwrap();
    assert_ne!(p1.etag, p2.etag);

    let completed = vec![
        CompletedPart { part_number: 1, etag: p1.etag },
        CompletedPart { part_number: 2, etag: p2.etag },
    ];
    let result = engine.complete(&id, &completed).await.unwrap();
    assert_eq!(result.bucket, "b");
    assert_eq!(result.key, "k");
    assert_eq!(result.location, "/b/k");
    assert!(result.etag.ends_with("-2"));

    assert_eq!(registry.get(&id).unwrap().status, UploadStatus::Complete);

    let mut expected = vec![0xa1; 64];
    expected.extend_from_slice(&[0xb2; 32]);
    assert_eq!(read_object(&store, "b", "k").await, expected);

    // The upload is closed for business.
    let err = engine
        .upload_part(&id, 3, bytes_stream(b"late"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::FailedPrecondition { .. }));
}

#[tokio::test]
async fn parts_upload_out_of_order_and_stale_etags_fail() {
    let (_dir, registry, store) = fixture();
    let engine = MultipartEngine::new(Arc::clone(&registry), store);

    let id = engine.create("b", "k").await.unwrap().upload_id;
    let p3 = engine.upload_part(&id, 3, bytes_stream(b"ccc"), None).await.unwrap();
    let p1 = engine.upload_part(&id, 1, bytes_stream(b"aaa"), None).await.unwrap();
    let p2 = engine.upload_part(&id, 2, bytes_stream(b"bbb"), None).await.unwrap();

    // Part 1 is re-uploaded; its first etag goes stale.
    let p1_new = engine.upload_part(&id, 1, bytes_stream(b"AAA"), None).await.unwrap();
    assert_ne!(p1.etag, p1_new.etag);

    let stale = vec![
        CompletedPart { part_number: 1, etag: p1.etag },
        CompletedPart { part_number: 2, etag: p2.etag.clone() },
        CompletedPart { part_number: 3, etag: p3.etag.clone() },
    ];
    let err = engine.complete(&id, &stale).await.unwrap_err();
    assert!(matches!(err, UploadError::InvalidArgument { .. }));
    assert_eq!(registry.get(&id).unwrap().status, UploadStatus::Open);

    let fresh = vec![
        CompletedPart { part_number: 1, etag: p1_new.etag },
        CompletedPart { part_number: 2, etag: p2.etag },
        CompletedPart { part_number: 3, etag: p3.etag },
    ];
    engine.complete(&id, &fresh).await.unwrap();
    assert_eq!(registry.get(&id).unwrap().status, UploadStatus::Complete);
}

#[tokio::test]
async fn part_numbers_are_bounded() {
    let (_dir, registry, store) = fixture();
    let engine = MultipartEngine::new(Arc::clone(&registry), store);
    let id = engine.create("b", "k").await.unwrap().upload_id;

    for bad in [0, -1, 10_001] {
        let err = engine
            .upload_part(&id, bad, bytes_stream(b"x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidArgument { .. }));
    }
}

#[tokio::test]
async fn part_checksum_mismatch_keeps_the_prior_part() {
    let (_dir, registry, store) = fixture();
    let engine = MultipartEngine::new(Arc::clone(&registry), store);
    let id = engine.create("b", "k").await.unwrap().upload_id;

    let original = engine.upload_part(&id, 1, bytes_stream(b"good"), None).await.unwrap();

    let err = engine
        .upload_part(
            &id,
            1,
            bytes_stream(b"evil"),
            Some(driftbay_checksum::crc32c(b"evil") ^ 1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Checksum(_)));

    let listing = engine.list_parts(&id, None, None).unwrap();
    assert_eq!(listing.parts.len(), 1);
    assert_eq!(listing.parts[0].etag, original.etag);
}

#[tokio::test]
async fn list_parts_paginates_ascending() {
    let (_dir, registry, store) = fixture();
    let engine = MultipartEngine::new(Arc::clone(&registry), store);
    let id = engine.create("b", "k").await.unwrap().upload_id;

    for n in [5, 3, 1, 4, 2] {
        engine
            .upload_part(&id, n, bytes_stream(format!("part{n}").as_bytes()), None)
            .await
            .unwrap();
    }

    let page1 = engine.list_parts(&id, Some(2), None).unwrap();
    let numbers: Vec<i32> = page1.parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert!(page1.is_truncated);
    assert_eq!(page1.next_part_number_marker, Some(2));

    let page2 = engine.list_parts(&id, Some(2), page1.next_part_number_marker).unwrap();
    let numbers: Vec<i32> = page2.parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![3, 4]);

    let page3 = engine.list_parts(&id, Some(2), page2.next_part_number_marker).unwrap();
    let numbers: Vec<i32> = page3.parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![5]);
    assert!(!page3.is_truncated);
    assert_eq!(page3.next_part_number_marker, None);
}

#[tokio::test]
async fn complete_requires_a_nonempty_ordered_list() {
    let (_dir, registry, store) = fixture();
    let engine = MultipartEngine::new(Arc::clone(&registry), store);
    let id = engine.create("b", "k").await.unwrap().upload_id;
    let p1 = engine.upload_part(&id, 1, bytes_stream(b"a"), None).await.unwrap();
    let p2 = engine.upload_part(&id, 2, bytes_stream(b"b"), None).await.unwrap();

    let err = engine.complete(&id, &[]).await.unwrap_err();
    assert!(matches!(err, UploadError::InvalidArgument { .. }));

    let unordered = vec![
        CompletedPart { part_number: 2, etag: p2.etag },
        CompletedPart { part_number: 1, etag: p1.etag },
    ];
    let err = engine.complete(&id, &unordered).await.unwrap_err();
    assert!(matches!(err, UploadError::InvalidArgument { .. }));
    assert_eq!(registry.get(&id).unwrap().status, UploadStatus::Open);
}

#[tokio::test]
async fn abort_multipart_is_idempotent_and_blocks_late_parts() {
    let (_dir, registry, store) = fixture();
    let engine = MultipartEngine::new(Arc::clone(&registry), store);
    let id = engine.create("b", "k").await.unwrap().upload_id;
    engine.upload_part(&id, 1, bytes_stream(b"a"), None).await.unwrap();

    engine.abort(&id).await.unwrap();
    engine.abort(&id).await.unwrap();

    let err = engine.upload_part(&id, 2, bytes_stream(b"b"), None).await.unwrap_err();
    assert!(matches!(err, UploadError::FailedPrecondition { .. }));
    let err = engine.complete(&id, &[CompletedPart { part_number: 1, etag: "e".into() }])
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::FailedPrecondition { .. }));
}

#[tokio::test]
async fn list_uploads_groups_by_delimiter_and_pages_by_markers() {
    let (_dir, registry, store) = fixture();
    let engine = MultipartEngine::new(Arc::clone(&registry), store);

    for key in ["photos/2024/a.jpg", "photos/2024/b.jpg", "docs/x.txt", "readme.md"] {
        engine.create("b", key).await.unwrap();
    }
    engine.create("other-bucket", "photos/elsewhere.jpg").await.unwrap();

    let listing = engine.list_uploads(
        "b",
        &ListUploadsParams {
            delimiter: Some("/".into()),
            ..Default::default()
        },
    );
    assert_eq!(listing.common_prefixes, vec!["docs/", "photos/"]);
    let keys: Vec<&str> = listing.uploads.iter().map(|u| u.key.as_str()).collect();
    assert_eq!(keys, vec!["readme.md"]);
    assert!(!listing.is_truncated);

    let listing = engine.list_uploads(
        "b",
        &ListUploadsParams {
            prefix: Some("photos/".into()),
            delimiter: Some("/".into()),
            ..Default::default()
        },
    );
    assert_eq!(listing.common_prefixes, vec!["photos/2024/"]);
    assert!(listing.uploads.is_empty());

    // Page through without a delimiter, one entry at a time.
    let mut seen = Vec::new();
    let mut params = ListUploadsParams {
        max_uploads: Some(1),
        ..Default::default()
    };
    loop {
        let page = engine.list_uploads("b", &params);
        seen.extend(page.uploads.iter().map(|u| u.key.clone()));
        if !page.is_truncated {
            break;
        }
        params.key_marker = page.next_key_marker;
        params.upload_id_marker = page.next_upload_id_marker;
    }
    assert_eq!(
        seen,
        vec!["docs/x.txt", "photos/2024/a.jpg", "photos/2024/b.jpg", "readme.md"]
    );
}

#[tokio::test]
async fn sweep_removes_scratch_without_a_session() {
    let (_dir, registry, store) = fixture();
    let writer = ResumableWriter::new(Arc::clone(&registry), store.clone());
    let engine = MultipartEngine::new(Arc::clone(&registry), store.clone());

    let stream_id = writer.open("b", "s").await.unwrap().upload_id;
    let mpu_id = engine.create("b", "m").await.unwrap().upload_id;
    engine.upload_part(&mpu_id, 1, bytes_stream(b"x"), None).await.unwrap();

    // Sessions still live: nothing to sweep.
    assert!(sweep_orphans(&registry, &store).await.unwrap().is_empty());

    // A registry that never saw these uploads (fresh process, sessions purged)
    // treats their scratch as orphaned.
    let empty = SessionRegistry::new();
    let mut removed = sweep_orphans(&empty, &store).await.unwrap();
    removed.sort();
    let mut expected = vec![stream_id, mpu_id];
    expected.sort();
    assert_eq!(removed, expected);
    assert!(sweep_orphans(&empty, &store).await.unwrap().is_empty());
}
