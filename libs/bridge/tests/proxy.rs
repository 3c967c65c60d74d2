mod common;

use native::{Errno, SocketType};
use std::time::Duration;
use zmq_bridge::{Error, ProxyArgs, ProxyEndpoint};

fn args(name: &str) -> ProxyArgs {
    ProxyArgs {
        frontend: ProxyEndpoint::new(SocketType::Pull, format!("inproc://{name}-front")),
        backend: ProxyEndpoint::new(SocketType::Push, format!("inproc://{name}-back")),
    }
}

#[test_log::test]
fn proxy_forwards_pauses_and_resumes() {
    let recording = common::recording();
    let module = common::module(&recording);
    let ctx = module.context();
    let proxy = module.proxy(&args("steered")).unwrap();

    let producer = ctx.socket(SocketType::Push).unwrap();
    producer.connect("inproc://steered-front").unwrap();
    let consumer = ctx.socket(SocketType::Pull).unwrap();
    consumer.connect("inproc://steered-back").unwrap();
    consumer.set_recv_timeout(Some(Duration::from_secs(2))).unwrap();

    producer.send_multipart(["job", "1"], 0).unwrap();
    assert_eq!(consumer.recv(0).unwrap().to_bytes().unwrap(), vec!["job", "1"]);

    proxy.pause().unwrap();
    producer.send("held", 0).unwrap();
    consumer.set_recv_timeout(Some(Duration::from_millis(100))).unwrap();
    let err = consumer.recv(0).unwrap_err();
    assert_eq!(err.errno(), Some(Errno::EAGAIN), "{err}");

    proxy.resume().unwrap();
    consumer.set_recv_timeout(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(consumer.recv(0).unwrap().to_bytes().unwrap(), vec!["held"]);

    proxy.terminate().unwrap();
    proxy.terminate().unwrap();
    assert!(!proxy.thread().is_running());
    assert!(matches!(proxy.pause(), Err(Error::Closed(_))));

    drop(producer);
    drop(consumer);
    module.finalize().unwrap();
    assert_eq!(recording.open_sockets(), 0);
}

#[test]
fn unknown_proxy_command_is_a_remote_error() {
    let recording = common::recording();
    let module = common::module(&recording);
    let proxy = module.proxy(&args("commands")).unwrap();

    let reply = proxy.thread().request(b"STATISTICS").unwrap();
    assert!(reply.starts_with(b"unknown command"));
    proxy.pause().unwrap();
    proxy.pause().unwrap();
    proxy.terminate().unwrap();
}

#[test]
fn proxy_with_a_taken_endpoint_fails_to_spawn() {
    let recording = common::recording();
    let module = common::module(&recording);
    let squatter = module.context().socket(SocketType::Pull).unwrap();
    squatter.bind("inproc://taken-front").unwrap();

    let err = module.proxy(&args("taken")).unwrap_err();
    assert!(matches!(err, Error::WorkerInit(_)), "{err}");
    assert_eq!(recording.open_contexts(), 1);
}
