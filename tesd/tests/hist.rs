//! MCA publisher completeness over a real TCP subscriber.

mod common;

use tesd::task::hist::HistTask;
use tesd::task::TaskLogic;
use tespkt::gen;

use common::{connect, recv_msg, rings, send_msg, settle, start_server};

#[tokio::test]
async fn published_histogram_matches_declared_size() {
    let r = rings(1);
    let logics: Vec<Box<dyn TaskLogic>> =
        vec![Box::new(HistTask::new(tespkt::McaSizeMode::FromLastBin).with_port(55821))];
    let (server, stop) = start_server(&r, logics).await;

    // connecting is subscribing; the task activates on the first one
    let mut sub = connect(55821).await;
    settle().await;

    // a 3-frame histogram: 16 bins total, declared size 104
    let mut frames = Vec::new();
    let mut mh = gen::mca_header(7, 16, 15, &[1, 2, 3, 4]);
    gen::set_fseq(&mut mh, 1);
    frames.push(mh);
    let mut mc = gen::mca_cont(1, &[5, 6, 7, 8, 9, 10]);
    gen::set_fseq(&mut mc, 2);
    frames.push(mc);
    let mut mc = gen::mca_cont(2, &[11, 12, 13, 14, 15, 16]);
    gen::set_fseq(&mut mc, 3);
    frames.push(mc);

    let mut expected = Vec::new();
    for f in &frames {
        expected.extend_from_slice(&f[tespkt::HDR_LEN..]);
        assert!(r.backend().push(0, f));
    }

    let msg = recv_msg(&mut sub).await;
    assert_eq!(msg.len(), 104);
    assert_eq!(&msg[..], &expected[..]);

    let _ = stop.send(());
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn sequence_gap_drops_the_histogram() {
    let r = rings(1);
    let logics: Vec<Box<dyn TaskLogic>> =
        vec![Box::new(HistTask::new(tespkt::McaSizeMode::FromLastBin).with_port(55822))];
    let (server, stop) = start_server(&r, logics).await;

    let mut sub = connect(55822).await;
    settle().await;

    // first histogram loses its middle frame (protocol sequence jumps)
    let mut mh = gen::mca_header(7, 16, 15, &[1, 2, 3, 4]);
    gen::set_fseq(&mut mh, 1);
    assert!(r.backend().push(0, &mh));
    let mut mc = gen::mca_cont(2, &[11, 12, 13, 14, 15, 16]);
    gen::set_fseq(&mut mc, 2);
    assert!(r.backend().push(0, &mc));

    // a complete one follows and is the first to come out
    let mut frames = Vec::new();
    let mut mh = gen::mca_header(7, 8, 7, &[1, 2, 3, 4]);
    gen::set_fseq(&mut mh, 3);
    frames.push(mh);
    let mut mc = gen::mca_cont(1, &[5, 6, 7, 8]);
    gen::set_fseq(&mut mc, 4);
    frames.push(mc);
    let mut expected = Vec::new();
    for f in &frames {
        expected.extend_from_slice(&f[tespkt::HDR_LEN..]);
        assert!(r.backend().push(0, f));
    }

    let msg = recv_msg(&mut sub).await;
    assert_eq!(msg.len(), 8 * 4 + 40);
    assert_eq!(&msg[..], &expected[..]);

    let _ = stop.send(());
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn ignores_malformed_subscriber_bytes() {
    let r = rings(1);
    let logics: Vec<Box<dyn TaskLogic>> =
        vec![Box::new(HistTask::new(tespkt::McaSizeMode::FromLastBin).with_port(55823))];
    let (server, stop) = start_server(&r, logics).await;

    let mut sub = connect(55823).await;
    settle().await;
    // publishers do not read; stray bytes must not break the stream
    send_msg(&mut sub, b"noise").await;

    let mut frames = Vec::new();
    let mut mh = gen::mca_header(7, 4, 3, &[1, 2]);
    gen::set_fseq(&mut mh, 1);
    frames.push(mh);
    let mut mc = gen::mca_cont(1, &[3, 4]);
    gen::set_fseq(&mut mc, 2);
    frames.push(mc);
    for f in &frames {
        assert!(r.backend().push(0, f));
    }

    let msg = recv_msg(&mut sub).await;
    assert_eq!(msg.len(), 4 * 4 + 40);

    let _ = stop.send(());
    server.await.unwrap().unwrap();
}
