//! End-to-end scenarios exercising the reactor through its public façades
//! only (no access to crate-internal types), matching the concrete
//! scenarios worked through during design: a full echo over a connected
//! stream, a recv raced against a timer, and a send raced against a close.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use solid_reactor::datagram::Datagram;
use solid_reactor::error::Error;
use solid_reactor::listener::Listener;
use solid_reactor::reactor::{Reactor, ReactorConfig};
use solid_reactor::stream::Stream;
use solid_reactor::timer::Timer;

fn run_until(reactor: &mut Reactor, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        reactor.run_once().unwrap();
        if done() {
            return;
        }
    }
    panic!("deadline exceeded waiting for completion");
}

#[test]
fn echo_channel_round_trips_client_and_server() {
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

    let listener = Listener::bind(&mut reactor, "127.0.0.1:0".parse().unwrap(), 128).unwrap();
    let addr = listener.local_addr().unwrap();

    let server: Rc<RefCell<Option<Stream>>> = Rc::new(RefCell::new(None));
    let server_cb = server.clone();
    listener
        .accept(&mut reactor, move |_ctx, conn| {
            *server_cb.borrow_mut() = Some(conn.unwrap());
        })
        .unwrap();

    let client_connected = Rc::new(RefCell::new(false));
    let client_connected_cb = client_connected.clone();
    let client = Stream::connect(&mut reactor, addr, move |_ctx| {
        *client_connected_cb.borrow_mut() = true;
    })
    .unwrap();

    run_until(&mut reactor, Duration::from_secs(2), || {
        server.borrow().is_some() && *client_connected.borrow()
    });

    let server = server.borrow_mut().take().unwrap();

    let server_got: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let server_got_cb = server_got.clone();
    server
        .post_recv_some(&mut reactor, 4, move |_ctx, buf| {
            *server_got_cb.borrow_mut() = Some(buf);
        })
        .unwrap();

    client
        .post_send_all(&mut reactor, b"ping".to_vec(), |_ctx| {})
        .unwrap();

    run_until(&mut reactor, Duration::from_secs(2), || server_got.borrow().is_some());
    assert_eq!(server_got.borrow().as_deref(), Some(b"ping".as_slice()));

    let client_got: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let client_got_cb = client_got.clone();
    client
        .post_recv_some(&mut reactor, 4, move |_ctx, buf| {
            *client_got_cb.borrow_mut() = Some(buf);
        })
        .unwrap();

    server
        .post_send_all(&mut reactor, b"ping".to_vec(), |_ctx| {})
        .unwrap();

    run_until(&mut reactor, Duration::from_secs(2), || client_got.borrow().is_some());
    assert_eq!(client_got.borrow().as_deref(), Some(b"ping".as_slice()));
}

#[test]
fn recv_canceled_by_a_racing_timer_fires_timer_then_recv() {
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

    let listener = Listener::bind(&mut reactor, "127.0.0.1:0".parse().unwrap(), 128).unwrap();
    let addr = listener.local_addr().unwrap();

    let server: Rc<RefCell<Option<Stream>>> = Rc::new(RefCell::new(None));
    let server_cb = server.clone();
    listener
        .accept(&mut reactor, move |_ctx, conn| {
            *server_cb.borrow_mut() = Some(conn.unwrap());
        })
        .unwrap();

    let _client = Stream::connect(&mut reactor, addr, |_ctx| {}).unwrap();
    run_until(&mut reactor, Duration::from_secs(2), || server.borrow().is_some());
    let server = server.borrow_mut().take().unwrap();

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let recv_order = order.clone();
    server
        .post_recv_some(&mut reactor, 16, move |_ctx, _buf| {
            recv_order.borrow_mut().push("recv");
        })
        .unwrap();

    let timer = Timer::new(&mut reactor).unwrap();
    let timer_order = order.clone();
    let server_for_timer = server.clone();
    timer
        .wait_for(&mut reactor, Duration::from_millis(50), move |ctx| {
            timer_order.borrow_mut().push("timer");
            let _ = server_for_timer.close(ctx.reactor());
        })
        .unwrap();

    run_until(&mut reactor, Duration::from_secs(2), || order.borrow().len() >= 2);

    assert_eq!(*order.borrow(), vec!["timer", "recv"]);
}

#[test]
fn send_raced_against_close_fires_exactly_once() {
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

    let listener = Listener::bind(&mut reactor, "127.0.0.1:0".parse().unwrap(), 128).unwrap();
    let addr = listener.local_addr().unwrap();

    let server: Rc<RefCell<Option<Stream>>> = Rc::new(RefCell::new(None));
    let server_cb = server.clone();
    listener
        .accept(&mut reactor, move |_ctx, conn| {
            *server_cb.borrow_mut() = Some(conn.unwrap());
        })
        .unwrap();

    let client = Stream::connect(&mut reactor, addr, |_ctx| {}).unwrap();
    run_until(&mut reactor, Duration::from_secs(2), || server.borrow().is_some());

    let fired: Rc<RefCell<Vec<Result<(), ()>>>> = Rc::new(RefCell::new(Vec::new()));
    let fired_cb = fired.clone();
    client
        .post_send_all(&mut reactor, b"hello".to_vec(), move |ctx| {
            let outcome = match ctx.error() {
                Some(Error::Canceled) => Err(()),
                _ => Ok(()),
            };
            fired_cb.borrow_mut().push(outcome);
        })
        .unwrap();
    client.close(&reactor).unwrap();

    run_until(&mut reactor, Duration::from_secs(2), || !fired.borrow().is_empty());

    // Run a few more turns to make sure the callback never fires twice.
    for _ in 0..5 {
        reactor.run_once().unwrap();
    }
    assert_eq!(fired.borrow().len(), 1);
}

#[test]
fn datagram_stations_exchange_one_packet_each_way() {
    let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();

    let a = Datagram::bind(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
    let b = Datagram::bind(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();

    let a_got: Rc<RefCell<Option<(Vec<u8>, Option<std::net::SocketAddr>)>>> =
        Rc::new(RefCell::new(None));
    let a_got_cb = a_got.clone();
    a.post_recv_from(&mut reactor, 16, move |_ctx, buf, peer| {
        *a_got_cb.borrow_mut() = Some((buf, peer));
    })
    .unwrap();

    b.post_send_to(&mut reactor, b"x".to_vec(), a_addr, |_ctx| {}).unwrap();
    run_until(&mut reactor, Duration::from_secs(2), || a_got.borrow().is_some());

    let (buf, peer) = a_got.borrow_mut().take().unwrap();
    assert_eq!(buf, b"x");
    assert_eq!(peer, Some(b_addr));
}
