use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use pathstream::blocking;
use pathstream::service::localfs::LocalFsPathService;
use pathstream::{
    ClientConfig, PathClient, PathKind, ReadOptions, StreamError, WriteMode, WriteOptions,
};
use tempfile::tempdir;

#[tokio::test]
async fn test_localfs_upload_read_and_append() {
    let tmp = tempdir().unwrap();
    let client = PathClient::new(
        Arc::new(LocalFsPathService::new(tmp.path())),
        ClientConfig::default(),
    )
    .unwrap();

    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 199) as u8).collect();
    let receipt = client
        .upload(
            "nested/dir/file.bin",
            Bytes::from(data.clone()),
            &WriteOptions::new().block_size(3000).parallelism(3),
        )
        .await
        .unwrap();
    assert_eq!(receipt.blocks, 7);
    assert_eq!(
        std::fs::read(tmp.path().join("nested/dir/file.bin")).unwrap(),
        data
    );

    let read = client
        .read_all("nested/dir/file.bin", &ReadOptions::new().chunk_size(4096))
        .await
        .unwrap();
    assert_eq!(read, data);

    let mut stream = client
        .open_write(
            "nested/dir/file.bin",
            &WriteOptions::new().mode(WriteMode::Append),
        )
        .await
        .unwrap();
    stream.write(b"tail").await.unwrap();
    let receipt = stream.close().await.unwrap();
    assert_eq!(receipt.length, 20_004);

    let props = client.properties("nested/dir").await.unwrap();
    assert_eq!(props.kind, PathKind::Directory);
    let err = client
        .open_read("nested", &ReadOptions::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StreamError::NotAFile(_)));
}

#[tokio::test]
async fn test_localfs_external_overwrite_breaks_pinned_stream() {
    let tmp = tempdir().unwrap();
    let client = PathClient::new(
        Arc::new(LocalFsPathService::new(tmp.path())),
        ClientConfig::default(),
    )
    .unwrap();
    client
        .upload("f", Bytes::from(vec![5u8; 64]), &WriteOptions::new())
        .await
        .unwrap();

    let mut stream = client
        .open_read("f", &ReadOptions::new().chunk_size(16))
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    stream.read(&mut buf).await.unwrap();
    std::fs::write(tmp.path().join("f"), vec![6u8; 80]).unwrap();

    let err = stream.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, StreamError::ConsistencyViolation { .. }));
}

#[tokio::test]
async fn test_localfs_paths_stay_under_root() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("store");
    let client = PathClient::new(
        Arc::new(LocalFsPathService::new(&root)),
        ClientConfig::default(),
    )
    .unwrap();

    let err = client
        .upload("../escaped.txt", Bytes::from_static(b"x"), &WriteOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::InvalidArgument(_)));
    assert!(!tmp.path().join("escaped.txt").exists());

    let err = client
        .upload(".pathstream/x", Bytes::from_static(b"x"), &WriteOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::InvalidArgument(_)));
    assert!(!root.join(".pathstream/x").exists());

    let err = client.properties(".pathstream").await.unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn test_blocking_client_over_localfs() {
    let tmp = tempdir().unwrap();
    let client = blocking::Client::new(
        Arc::new(LocalFsPathService::new(tmp.path())),
        ClientConfig::default(),
    )
    .unwrap();

    let mut writer = client
        .open_write("doc.txt", &WriteOptions::new().block_size(8))
        .unwrap();
    writeln!(writer, "hello from a blocking writer").unwrap();
    let receipt = writer.close().unwrap();
    assert_eq!(receipt.blocks, 4);

    let mut reader = client
        .open_read("doc.txt", &ReadOptions::new().chunk_size(5))
        .unwrap();
    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();
    assert_eq!(text, "hello from a blocking writer\n");
    assert_eq!(reader.skip(10).unwrap(), 0);
}
