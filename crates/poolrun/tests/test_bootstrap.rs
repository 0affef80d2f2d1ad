//! Pool construction against missing or broken interpreter images.

use std::io::Write;

use poolrun::ImageCandidate;
use poolrun::Launcher;
use poolrun::Pool;
use poolrun::bootstrap;
use poolrun::pool;

#[test]
fn test_default_pool_without_embedded_image_fails() {
    // The test binary links no interpreter image.
    let err = Pool::new(2).unwrap_err();

    let pool::Error::Instance { ordinal, source } = &err else {
        panic!("unexpected error: {}", err);
    };
    assert_eq!(*ordinal, 0);
    let msg = source.to_string();
    assert!(msg.contains("embedded_interpreter_all"), "{}", msg);
    assert!(msg.contains("embedded_interpreter_cpu"), "{}", msg);
}

#[test]
fn test_search_path_order_is_reported() {
    let launcher = Launcher::Embedded(vec![
        ImageCandidate::embedded("interp_gpu", "no_such_gpu_image", false),
        ImageCandidate::embedded("interp_cpu", "no_such_cpu_image", false),
    ]);

    let err = launcher.launch().err().expect("no image should be found");
    match err {
        bootstrap::Error::NoImage { searched } => assert_eq!(searched, vec!["interp_gpu", "interp_cpu"]),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_unloadable_image_aborts_pool_construction() {
    let mut image = tempfile::NamedTempFile::new().unwrap();
    image.write_all(&[0x7f, b'E', b'L', b'F', 0, 0, 0, 0]).unwrap();

    let err = Pool::builder()
        .instances(3)
        .launcher(Launcher::Embedded(vec![ImageCandidate::file(image.path(), false)]))
        .build()
        .unwrap_err();

    assert!(matches!(
        err,
        pool::Error::Instance { ordinal: 0, source: poolrun::instance::Error::Bootstrap(bootstrap::Error::Load { .. }) }
    ));
}
