mod common;

use common::Idle;
use native::{consts, SocketType};
use std::time::Duration;
use zmq_bridge::{BackgroundThread, Close, ResourceKind, Socket};

#[test]
fn every_wrapper_releases_exactly_once() {
    let recording = common::recording();
    let ctx = common::context(&recording);

    let socket = ctx.socket(SocketType::Pair).unwrap();
    let raw_socket = socket.raw().unwrap();
    for _ in 0..3 {
        socket.close();
    }
    socket.close_now();
    assert_eq!(recording.count_on("close", raw_socket.0), 1);

    let message = ctx.message(b"payload").unwrap();
    message.close();
    message.close();
    drop(message);
    assert_eq!(recording.count("msg_close"), 1);

    let poller = ctx.poller().unwrap();
    poller.close();
    drop(poller);
    assert_eq!(recording.count("poller_destroy"), 1);

    let timers = ctx.timers().unwrap();
    timers.close();
    timers.close();
    assert_eq!(recording.count("timers_destroy"), 1);

    ctx.terminate().unwrap();
    assert_eq!(recording.count_on("close", raw_socket.0), 1);
    assert_eq!(recording.count("poller_destroy"), 1);
    assert_eq!(recording.count("timers_destroy"), 1);
}

#[test]
fn explicit_close_racing_the_sweep_releases_once() {
    let recording = common::recording();
    let ctx = common::context(&recording);
    let sockets: Vec<Socket> = (0..32)
        .map(|_| ctx.socket(SocketType::Pair).unwrap())
        .collect();

    std::thread::scope(|scope| {
        let closer = scope.spawn(|| sockets.iter().for_each(Socket::close_now));
        ctx.release_all();
        closer.join().unwrap();
    });

    assert_eq!(recording.count("socket"), 32);
    assert_eq!(recording.calls_of("close").iter().filter(|c| c.ok).count(), 32);
    assert_eq!(recording.open_sockets(), 0);
}

#[test_log::test]
fn finalize_joins_threads_before_closing_sockets() {
    let recording = common::recording();
    let module = common::module(&recording);
    let root = module.context().raw();

    let sockets: Vec<Socket> = (0..3)
        .map(|_| module.context().socket(SocketType::Pair).unwrap())
        .collect();
    let socket_handles: Vec<u64> = sockets.iter().map(|s| s.raw().unwrap().0).collect();
    let threads: Vec<BackgroundThread> = (0..2).map(|_| module.spawn::<Idle>(&()).unwrap()).collect();
    assert_eq!(module.context().registry().live(ResourceKind::Thread), 2);

    module.finalize().unwrap();

    let calls = recording.calls();
    let joins: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, call)| call.op == "thread_join")
        .map(|(index, _)| index)
        .collect();
    let first_socket_close = calls
        .iter()
        .position(|call| call.op == "close" && socket_handles.contains(&call.handle))
        .unwrap();
    assert_eq!(joins.len(), 2);
    assert!(joins.iter().all(|&join| join < first_socket_close));

    let last = calls.last().unwrap();
    assert_eq!(last.op, "ctx_term");
    assert_eq!(last.handle, root.0);

    assert!(sockets.iter().all(Socket::is_closed));
    assert!(threads.iter().all(|thread| !thread.is_running()));
    assert_eq!(recording.open_sockets(), 0);
    assert_eq!(recording.open_contexts(), 0);
}

#[test]
fn finalize_shuts_the_context_down_first() {
    let recording = common::recording();
    let module = common::module(&recording);
    let _thread = module.spawn::<Idle>(&()).unwrap();
    let root = module.context().raw();
    recording.clear();

    module.finalize().unwrap();
    let first = recording.calls().into_iter().next().unwrap();
    assert_eq!(first.op, "ctx_shutdown");
    assert_eq!(first.handle, root.0);
}

#[test]
fn finalized_module_refuses_new_resources() {
    let recording = common::recording();
    let module = common::module(&recording);
    module.finalize().unwrap();

    assert!(module.context().socket(SocketType::Pair).is_err());
    assert!(module.spawn::<Idle>(&()).is_err());
    module.finalize().unwrap();
    assert_eq!(recording.count("ctx_term"), 1);
}

#[test]
fn dropped_socket_is_released_with_bounded_linger() {
    let recording = common::recording();
    let ctx = common::context(&recording);
    let socket = ctx.socket(SocketType::Pair).unwrap();
    let raw = socket.raw().unwrap();
    drop(socket);

    let lingers: Vec<_> = recording
        .calls_of("setsockopt")
        .into_iter()
        .filter(|call| call.handle == raw.0 && call.detail == Some(consts::LINGER.to_string()))
        .collect();
    assert_eq!(lingers.len(), 1);
    assert_eq!(recording.count_on("close", raw.0), 1);
    assert_eq!(ctx.registry().live(ResourceKind::Socket), 0);
}

#[test]
fn blocking_close_waits_for_the_worker() {
    let recording = common::recording();
    let module = common::module(&recording);
    let thread = module.spawn::<Idle>(&()).unwrap();

    std::thread::sleep(Duration::from_millis(10));
    thread.close(Close::Blocking).unwrap();
    assert_eq!(recording.count("thread_join"), 1);
    assert_eq!(recording.count("thread_detach"), 0);
    assert_eq!(module.context().registry().live(ResourceKind::Thread), 0);
}
