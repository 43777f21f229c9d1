use std::{io::Cursor, sync::Arc};

use chartographer::{
    ErrorKind, Registry, Response, Service, StoreConfig, raster::codec,
};
use image::{Rgba, RgbaImage};

fn temp_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "chartographer_{name}_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ))
}

fn run(service: &Service, lines: &[String]) -> Vec<Response> {
    let input = lines.join("\n");
    let mut out = Vec::new();
    service
        .serve_lines(Cursor::new(input.into_bytes()), &mut out)
        .unwrap();
    String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn error_kind(resp: &Response) -> Option<ErrorKind> {
    match resp {
        Response::Err { error, .. } => Some(*error),
        Response::Ok { .. } => None,
    }
}

#[test]
fn full_session_over_json_lines() {
    let root = temp_dir("protocol_session");
    let files = temp_dir("protocol_files");
    std::fs::create_dir_all(&files).unwrap();

    let service = Service::new(Arc::new(
        Registry::open(StoreConfig::with_root(root.join("canvases"))).unwrap(),
    ));

    let red = Rgba([200, 10, 10, 255]);
    let payload = files.join("patch.bmp");
    std::fs::write(
        &payload,
        codec::encode_image(&RgbaImage::from_pixel(4, 4, red)),
    )
    .unwrap();
    let out = files.join("read.bmp");

    let lines = vec![
        r#"{"op":"create","width":6,"height":5}"#.to_string(),
        format!(
            r#"{{"op":"update","id":0,"x":3,"y":2,"width":4,"height":4,"payload":{}}}"#,
            serde_json::to_string(&payload).unwrap()
        ),
        format!(
            r#"{{"op":"read","id":0,"x":2,"y":1,"width":5,"height":5,"out":{}}}"#,
            serde_json::to_string(&out).unwrap()
        ),
        r#"{"op":"delete","id":0}"#.to_string(),
        r#"{"op":"delete","id":0}"#.to_string(),
    ];
    let resps = run(&service, &lines);

    assert_eq!(resps.len(), 5);
    assert_eq!(resps[0], Response::success(Some(chartographer::CanvasId(0))));
    assert!(resps[1].is_ok());
    assert!(resps[2].is_ok());
    assert!(resps[3].is_ok());
    assert_eq!(error_kind(&resps[4]), Some(ErrorKind::NotFound));

    let got = image::load_from_memory_with_format(
        &std::fs::read(&out).unwrap(),
        image::ImageFormat::Bmp,
    )
    .unwrap()
    .to_rgba8();
    assert_eq!(got.dimensions(), (5, 5));
    for (i, j, px) in got.enumerate_pixels() {
        let (x, y) = (2 + i, 1 + j);
        let want = if x >= 6 || y >= 5 {
            codec::BLACK
        } else if x >= 3 && y >= 2 {
            red
        } else {
            codec::BLACK
        };
        assert_eq!(*px, want, "pixel ({x}, {y})");
    }
    assert!(service.registry().live_ids().is_empty());

    std::fs::remove_dir_all(&root).ok();
    std::fs::remove_dir_all(&files).ok();
}

#[test]
fn malformed_and_invalid_requests_get_error_lines() {
    let root = temp_dir("protocol_errors");
    let service = Service::new(Arc::new(
        Registry::open(StoreConfig::with_root(&root)).unwrap(),
    ));

    let lines = vec![
        "not json".to_string(),
        String::new(),
        r#"{"op":"resize","id":0}"#.to_string(),
        r#"{"op":"create","width":0,"height":10}"#.to_string(),
        r#"{"op":"create","width":20001,"height":10}"#.to_string(),
        r#"{"op":"delete","id":-1}"#.to_string(),
        r#"{"op":"read","id":7,"x":0,"y":0,"width":1,"height":1,"out":"unused.bmp"}"#.to_string(),
        r#"{"op":"update","id":0,"x":0,"y":0,"width":1,"height":1,"payload":"/nonexistent/p.bmp"}"#
            .to_string(),
        r#"{"op":"create","width":2,"height":2}"#.to_string(),
    ];
    let resps = run(&service, &lines);

    // The blank line gets no response.
    assert_eq!(resps.len(), 8);
    assert_eq!(error_kind(&resps[0]), Some(ErrorKind::Parameter));
    assert_eq!(error_kind(&resps[1]), Some(ErrorKind::Parameter));
    assert_eq!(error_kind(&resps[2]), Some(ErrorKind::Parameter));
    assert_eq!(error_kind(&resps[3]), Some(ErrorKind::Parameter));
    assert_eq!(error_kind(&resps[4]), Some(ErrorKind::NotFound));
    assert_eq!(error_kind(&resps[5]), Some(ErrorKind::NotFound));
    // Unreadable payloads are rejected before the canvas is looked up.
    assert_eq!(error_kind(&resps[6]), Some(ErrorKind::Parameter));
    // Failed creates consumed no id.
    assert_eq!(resps[7], Response::success(Some(chartographer::CanvasId(0))));

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn negative_ids_report_their_own_value() {
    let root = temp_dir("protocol_negative");
    let service = Service::new(Arc::new(
        Registry::open(StoreConfig::with_root(&root)).unwrap(),
    ));

    let resps = run(&service, &[r#"{"op":"delete","id":-7}"#.to_string()]);
    match &resps[..] {
        [Response::Err { error, message, .. }] => {
            assert_eq!(*error, ErrorKind::NotFound);
            assert_eq!(message, "canvas -7 not found");
        }
        other => panic!("unexpected responses {other:?}"),
    }

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn concurrent_workers_answer_in_request_order() {
    let root = temp_dir("protocol_workers");
    let files = temp_dir("protocol_workers_files");
    std::fs::create_dir_all(&files).unwrap();

    let registry = Arc::new(Registry::open(StoreConfig::with_root(&root)).unwrap());
    let canvases = 12;
    for _ in 0..canvases * 2 {
        registry.create(64, 64).unwrap();
    }
    let service = Service::with_request_workers(registry, 4).unwrap();

    // Requests run concurrently, so reads and deletes never target the same canvas.
    // Per step: read canvas `id`, a malformed line, delete canvas `id + canvases`.
    let mut lines = Vec::new();
    for id in 0..canvases {
        let out = files.join(format!("{id}.bmp"));
        lines.push(format!(
            r#"{{"op":"read","id":{id},"x":-8,"y":-8,"width":80,"height":80,"out":{}}}"#,
            serde_json::to_string(&out).unwrap()
        ));
        lines.push("{".to_string());
        lines.push(format!(r#"{{"op":"delete","id":{}}}"#, id + canvases));
    }
    lines.push(r#"{"op":"delete","id":99}"#.to_string());

    let resps = run(&service, &lines);
    assert_eq!(resps.len(), canvases * 3 + 1);
    for (id, triple) in resps.chunks(3).take(canvases).enumerate() {
        assert!(triple[0].is_ok(), "read of {id}: {:?}", triple[0]);
        assert_eq!(error_kind(&triple[1]), Some(ErrorKind::Parameter));
        assert!(triple[2].is_ok(), "delete of {}: {:?}", id + canvases, triple[2]);
        assert!(files.join(format!("{id}.bmp")).is_file());
    }
    assert_eq!(error_kind(&resps[canvases * 3]), Some(ErrorKind::NotFound));
    assert_eq!(
        service.registry().live_ids(),
        (0..canvases as u64)
            .map(chartographer::CanvasId)
            .collect::<Vec<_>>()
    );

    std::fs::remove_dir_all(&root).ok();
    std::fs::remove_dir_all(&files).ok();
}
