//! End-to-end capture scenarios over the in-memory ring backend.

mod common;

use std::path::Path;
use std::sync::Arc;

use tesd::api::{cap_status, CaptureReply, CaptureRequest};
use tesd::hdf5::NullConverter;
use tesd::task::capture::CaptureTask;
use tesd::task::TaskLogic;
use tespkt::gen;

use common::{connect, recv_msg, rings, rings_with, send_msg, settle, start_server};

fn capture_task(root: &Path, port: u16) -> Vec<Box<dyn TaskLogic>> {
    vec![Box::new(
        CaptureTask::new(
            root.to_path_buf(),
            false,
            false,
            tespkt::McaSizeMode::FromLastBin,
            Arc::new(NullConverter),
        )
        .with_port(port),
    )]
}

fn request(filename: &str, min_ticks: u64, min_events: u64) -> CaptureRequest {
    CaptureRequest {
        filename: filename.into(),
        measurement: "m1".into(),
        min_ticks,
        min_events,
        overwrite: 0,
        async_conversion: false,
        mode: 0,
    }
}

fn tick(fseq: u16) -> Vec<u8> {
    gen::TickBuilder::new().fseq(fseq).period(1000).build()
}

fn peak(fseq: u16) -> Vec<u8> {
    let mut f = gen::event_frame(tespkt::TYPE_PEAK, 0, 1, &[0u8; 8]);
    gen::set_fseq(&mut f, fseq);
    f
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[tokio::test]
async fn minimal_capture_counts_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let r = rings(2);
    let (server, stop) = start_server(&r, capture_task(dir.path(), 55801)).await;

    let mut client = connect(55801).await;
    send_msg(&mut client, &request("runA", 1, 0).encode()).await;
    settle().await;

    // one tick to open the recording, ten events, the closing tick
    assert!(r.backend().push(0, &tick(1)));
    for i in 0..10u16 {
        assert!(r.backend().push(0, &peak(2 + i)));
    }
    assert!(r.backend().push(0, &tick(12)));

    let reply = CaptureReply::decode(recv_msg(&mut client).await).unwrap();
    assert_eq!(reply.status, cap_status::OK);
    assert_eq!(reply.counts.ticks, 2);
    assert_eq!(reply.counts.events, 10);
    assert_eq!(reply.counts.traces, 0);
    assert_eq!(reply.counts.hists, 0);
    assert_eq!(reply.counts.frames, 12);
    assert_eq!(reply.counts.frames_lost, 0);
    assert_eq!(reply.counts.frames_dropped, 0);

    let base = dir.path().join("runA");
    assert_eq!(file_len(&base.with_extension("fidx")), 12 * 16);
    assert_eq!(file_len(&base.with_extension("tdat")), 2 * 24);
    assert_eq!(file_len(&base.with_extension("edat")), 10 * 8);
    assert_eq!(file_len(&base.with_extension("stats")), 64);

    // a status query replies with the same seven counters, and is
    // idempotent
    for _ in 0..2 {
        send_msg(&mut client, &request("runA", 0, 0).encode()).await;
        let status = CaptureReply::decode(recv_msg(&mut client).await).unwrap();
        assert_eq!(status.status, cap_status::OK);
        assert_eq!(status.counts, reply.counts);
    }

    let _ = stop.send(());
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn interrupted_trace_is_not_indexed() {
    let dir = tempfile::tempdir().unwrap();
    let r = rings(1);
    let (server, stop) = start_server(&r, capture_task(dir.path(), 55802)).await;

    let mut client = connect(55802).await;
    send_msg(&mut client, &request("runB", 1, 0).encode()).await;
    settle().await;

    assert!(r.backend().push(0, &tick(1)));

    // trace declaring 1000 bytes, delivered only partially
    let mut th = gen::trace_header(tespkt::TRACE_SGL, 1, 1000, &[0u8; 240]);
    gen::set_fseq(&mut th, 2);
    assert!(r.backend().push(0, &th));
    for (i, pseq) in (1..=3u16).enumerate() {
        let mut tc = gen::trace_cont(tespkt::TRACE_SGL, pseq, 1, &[0u8; 160]);
        gen::set_fseq(&mut tc, 3 + i as u16);
        assert!(r.backend().push(0, &tc));
    }

    // an MCA header interrupts the trace and starts its own stream
    let mut mh = gen::mca_header(0, 16, 15, &[1, 2, 3, 4]);
    gen::set_fseq(&mut mh, 6);
    assert!(r.backend().push(0, &mh));
    for (i, pseq) in (1..=2u16).enumerate() {
        let mut mc = gen::mca_cont(pseq, &[0u32; 6]);
        gen::set_fseq(&mut mc, 7 + i as u16);
        assert!(r.backend().push(0, &mc));
    }

    assert!(r.backend().push(0, &tick(9)));

    let reply = CaptureReply::decode(recv_msg(&mut client).await).unwrap();
    assert_eq!(reply.status, cap_status::OK);
    assert_eq!(reply.counts.traces, 0);
    assert_eq!(reply.counts.hists, 1);
    assert_eq!(reply.counts.frames, 9);

    let base = dir.path().join("runB");
    // no completed trace: nothing in the trace index, while the partial
    // payload bytes still sit in the event stream
    assert_eq!(file_len(&base.with_extension("ridx")), 0);
    assert_eq!(file_len(&base.with_extension("midx")), 16);
    assert_eq!(file_len(&base.with_extension("edat")), 240 + 3 * 160);
    assert_eq!(file_len(&base.with_extension("mdat")), 104);

    let _ = stop.send(());
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn overlong_frame_is_clipped_and_routed_bad() {
    let dir = tempfile::tempdir().unwrap();
    let r = rings(1);
    let (server, stop) = start_server(&r, capture_task(dir.path(), 55803)).await;

    let mut client = connect(55803).await;
    send_msg(&mut client, &request("runC", 1, 0).encode()).await;
    settle().await;

    assert!(r.backend().push(0, &tick(1)));

    // header claims 1000 bytes, the slot holds 48
    let mut bad = gen::event_frame(tespkt::TYPE_PEAK, 0, 1, &[0u8; 24]);
    gen::set_fseq(&mut bad, 2);
    bad[14..16].copy_from_slice(&1000u16.to_le_bytes());
    assert!(r.backend().push(0, &bad));

    assert!(r.backend().push(0, &tick(3)));

    let reply = CaptureReply::decode(recv_msg(&mut client).await).unwrap();
    assert_eq!(reply.status, cap_status::OK);
    assert_eq!(reply.counts.frames, 3);
    assert_eq!(reply.counts.frames_dropped, 1);

    let base = dir.path().join("runC");
    // clipped to the slot: 48 bytes minus the header
    assert_eq!(file_len(&base.with_extension("bdat")), 24);

    let fidx = std::fs::read(base.with_extension("fidx")).unwrap();
    assert_eq!(fidx.len(), 3 * 16);
    // second record is the bad frame
    assert_eq!(fidx[16 + 15] & 0x0f, 9);

    let _ = stop.send(());
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn no_overwrite_rejects_second_job() {
    let dir = tempfile::tempdir().unwrap();
    let r = rings(1);
    let (server, stop) = start_server(&r, capture_task(dir.path(), 55804)).await;

    let mut client = connect(55804).await;
    send_msg(&mut client, &request("runD", 1, 0).encode()).await;
    settle().await;
    assert!(r.backend().push(0, &tick(1)));
    assert!(r.backend().push(0, &tick(2)));
    let reply = CaptureReply::decode(recv_msg(&mut client).await).unwrap();
    assert_eq!(reply.status, cap_status::OK);

    let fidx = dir.path().join("runD.fidx");
    let size_before = file_len(&fidx);

    send_msg(&mut client, &request("runD", 1, 0).encode()).await;
    let reply = CaptureReply::decode(recv_msg(&mut client).await).unwrap();
    assert_eq!(reply.status, cap_status::EABORT);
    assert_eq!(file_len(&fidx), size_before);

    let _ = stop.send(());
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn filename_escape_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let r = rings(1);
    let (server, stop) = start_server(&r, capture_task(dir.path(), 55805)).await;

    let mut client = connect(55805).await;
    send_msg(&mut client, &request("../outside", 1, 0).encode()).await;
    let reply = CaptureReply::decode(recv_msg(&mut client).await).unwrap();
    assert_eq!(reply.status, cap_status::EPERM);

    // unknown overwrite mode is malformed
    let mut bad = request("runE", 1, 0);
    bad.overwrite = 9;
    send_msg(&mut client, &bad.encode()).await;
    let reply = CaptureReply::decode(recv_msg(&mut client).await).unwrap();
    assert_eq!(reply.status, cap_status::EINV);

    // status query for a job that never ran
    send_msg(&mut client, &request("nosuch", 0, 0).encode()).await;
    let reply = CaptureReply::decode(recv_msg(&mut client).await).unwrap();
    assert_eq!(reply.status, cap_status::EABORT);

    let _ = stop.send(());
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_flushes_active_job() {
    let dir = tempfile::tempdir().unwrap();
    let r = rings_with(1, 256);
    let (server, stop) = start_server(&r, capture_task(dir.path(), 55806)).await;

    let mut client = connect(55806).await;
    send_msg(&mut client, &request("runF", 1000, 0).encode()).await;
    settle().await;

    for i in 0..100u16 {
        assert!(r.backend().push(0, &tick(1 + i)));
    }
    settle().await;

    let _ = stop.send(());
    let reply = CaptureReply::decode(recv_msg(&mut client).await).unwrap();
    // the minimum was not reached: a short-count reply
    assert_eq!(reply.status, cap_status::EWRT);
    assert_eq!(reply.counts.ticks, 100);

    server.await.unwrap().unwrap();

    let base = dir.path().join("runF");
    // files are truncated to their true size, no trailing padding
    assert_eq!(file_len(&base.with_extension("tdat")), 100 * 24);
    assert_eq!(file_len(&base.with_extension("fidx")), 100 * 16);
    assert_eq!(file_len(&base.with_extension("stats")), 64);
}
