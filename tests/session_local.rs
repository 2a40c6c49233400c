use std::{
    io::{Read, Write},
    sync::Arc,
    time::{Duration, Instant},
};

use ajbusd::{
    attachment::Attachment,
    bus::{Bus, BusState},
    codec::{Message, SessionOpts, Traffic},
    config::Config,
    name_service::InProcessNetwork,
    sessions::JoinReply,
};
use enumflags2::BitFlags;
use ntest::timeout;

const SUCCESS: u32 = 1;

fn init_logging() {
    #[cfg(feature = "tracing-subscriber")]
    {
        use tracing_subscriber::{EnvFilter, FmtSubscriber};

        let _ = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }
}

fn start_bus(network: &InProcessNetwork) -> Arc<BusState> {
    let mut bus = Bus::new(Config::default(), network.node()).unwrap();
    let state = bus.state().clone();
    tokio::spawn(async move {
        let _ = bus.run().await;
    });
    state
}

/// Wait for the first message satisfying `pred`, discarding the rest.
async fn wait_for(
    attachment: &Attachment,
    max_wait: Duration,
    pred: impl Fn(&Message) -> bool,
) -> Option<Arc<Message>> {
    let deadline = Instant::now() + max_wait;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let msg = attachment.next_message(deadline - now).await?;
        if pred(&msg) {
            return Some(msg);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(30000)]
async fn self_join_is_rejected() {
    init_logging();
    let network = InProcessNetwork::new();
    let bus = start_bus(&network);

    let x = bus.attach(true);
    let (code, port) = x
        .bind_session_port(42, SessionOpts::messages_point_to_point())
        .await;
    assert_eq!(code, SUCCESS);
    assert_eq!(port, 42);

    assert_eq!(x.request_name("svc.self", BitFlags::empty()).await, 1);

    let (reply, id, _) = x
        .join_session("svc.self", 42, SessionOpts::messages_point_to_point())
        .await;
    assert_eq!(reply, JoinReply::AlreadyJoined);
    assert_eq!(id, 0);
    // The session map is untouched: reservation only, no live session.
    assert_eq!(bus.sessions().session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(30000)]
async fn two_party_message_session() {
    init_logging();
    let network = InProcessNetwork::new();
    let bus = start_bus(&network);

    let a = bus.attach(true);
    let b = bus.attach(true);
    let a_name = a.unique_name().to_string();
    let b_name = b.unique_name().to_string();

    let (code, _) = a
        .bind_session_port(42, SessionOpts::messages_point_to_point())
        .await;
    assert_eq!(code, SUCCESS);

    let (reply, id, opts) = b
        .join_session(&a_name, 42, SessionOpts::messages_point_to_point())
        .await;
    assert_eq!(reply, JoinReply::Success);
    assert_ne!(id, 0);
    assert_eq!(opts.traffic, Traffic::Messages);

    // The binder observes the join.
    let joined = wait_for(&a, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("SessionJoined")
    })
    .await
    .expect("binder never saw SessionJoined");
    assert_eq!(joined.arg_u16(0).unwrap(), 42);
    assert_eq!(joined.arg_u32(1).unwrap(), id);
    assert_eq!(joined.arg_str(2).unwrap(), b_name);

    // A session signal from B reaches A exactly once.
    b.send_session_signal(id, "org.test.chat", "Blast", vec![])
        .await
        .unwrap();
    let blast = wait_for(&a, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("Blast")
    })
    .await
    .expect("binder never saw the session signal");
    assert_eq!(blast.session_id, id);
    assert!(wait_for(&a, Duration::from_millis(300), |m| {
        m.member.as_deref() == Some("Blast")
    })
    .await
    .is_none());

    // B leaves; A is told the session is gone, with the leave reason.
    assert_eq!(b.leave_session(id).await, SUCCESS);
    let lost = wait_for(&a, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("SessionLostWithReason")
    })
    .await
    .expect("binder never saw SessionLost");
    assert_eq!(lost.arg_u32(0).unwrap(), id);
    // RemoteEndLeft
    assert_eq!(lost.arg_u32(1).unwrap(), 1);

    assert_eq!(bus.sessions().session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(30000)]
async fn multipoint_fan_out() {
    init_logging();
    let network = InProcessNetwork::new();
    let bus = start_bus(&network);

    let a = bus.attach(true);
    let b = bus.attach(true);
    let c = bus.attach(true);
    let a_name = a.unique_name().to_string();
    let b_name = b.unique_name().to_string();
    let c_name = c.unique_name().to_string();

    let (code, _) = a
        .bind_session_port(42, SessionOpts::messages_multipoint())
        .await;
    assert_eq!(code, SUCCESS);

    let (reply, id_b, _) = b
        .join_session(&a_name, 42, SessionOpts::messages_multipoint())
        .await;
    assert_eq!(reply, JoinReply::Success);
    // B is told who is already in: the host.
    let caught_up = wait_for(&b, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("MPSessionChanged") && m.arg_str(1).unwrap() == a_name
    })
    .await
    .expect("joiner never caught up on the host");
    assert_eq!(caught_up.arg_u32(0).unwrap(), id_b);

    let (reply, id_c, _) = c
        .join_session(&a_name, 42, SessionOpts::messages_multipoint())
        .await;
    assert_eq!(reply, JoinReply::Success);
    // A multipoint port yields one shared session.
    assert_eq!(id_b, id_c);

    // A and B both learn about C.
    for (watcher, who) in [(&a, "host"), (&b, "first joiner")] {
        let seen = wait_for(watcher, Duration::from_secs(5), |m| {
            m.member.as_deref() == Some("MPSessionChanged")
                && m.arg_str(1).unwrap() == c_name
                && m.arg(2).unwrap().as_bool() == Some(true)
        })
        .await;
        assert!(seen.is_some(), "{who} never saw C join");
    }
    // C catches up on both A and B.
    for name in [&a_name, &b_name] {
        let seen = wait_for(&c, Duration::from_secs(5), |m| {
            m.member.as_deref() == Some("MPSessionChanged")
                && m.arg_str(1).unwrap() == *name
                && m.arg(2).unwrap().as_bool() == Some(true)
        })
        .await;
        assert!(seen.is_some(), "C never caught up on {name}");
    }

    // One multicast from B lands exactly once at A and at C.
    b.send_session_signal(id_b, "org.test.chat", "Blast", vec![])
        .await
        .unwrap();
    for (watcher, who) in [(&a, "host"), (&c, "other member")] {
        assert!(
            wait_for(watcher, Duration::from_secs(5), |m| {
                m.member.as_deref() == Some("Blast")
            })
            .await
            .is_some(),
            "{who} missed the multicast"
        );
        assert!(
            wait_for(watcher, Duration::from_millis(300), |m| {
                m.member.as_deref() == Some("Blast")
            })
            .await
            .is_none(),
            "{who} saw the multicast twice"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(30000)]
async fn binder_removes_member() {
    init_logging();
    let network = InProcessNetwork::new();
    let bus = start_bus(&network);

    let a = bus.attach(true);
    let b = bus.attach(true);
    let a_name = a.unique_name().to_string();
    let b_name = b.unique_name().to_string();

    a.bind_session_port(42, SessionOpts::messages_multipoint())
        .await;
    let (reply, id, _) = b
        .join_session(&a_name, 42, SessionOpts::messages_multipoint())
        .await;
    assert_eq!(reply, JoinReply::Success);

    // Only the binder may do this, and only on multipoint sessions.
    assert_eq!(b.remove_session_member(id, &a_name).await, 4); // NotBinder
    assert_eq!(a.remove_session_member(id, ":nobody.9").await, 5); // NotFound
    assert_eq!(a.remove_session_member(id, &b_name).await, SUCCESS);

    let lost = wait_for(&b, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("SessionLostWithReason")
    })
    .await
    .expect("removed member never told");
    assert_eq!(lost.arg_u32(0).unwrap(), id);
    // RemovedByBinder
    assert_eq!(lost.arg_u32(1).unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(30000)]
async fn raw_session_hands_over_socket_pair() {
    init_logging();
    let network = InProcessNetwork::new();
    let bus = start_bus(&network);

    let a = bus.attach(true);
    let b = bus.attach(true);
    let a_name = a.unique_name().to_string();

    let (code, _) = a
        .bind_session_port(43, SessionOpts::raw_reliable_point_to_point())
        .await;
    assert_eq!(code, SUCCESS);

    let (reply, id, opts) = b
        .join_session(&a_name, 43, SessionOpts::raw_reliable_point_to_point())
        .await;
    assert_eq!(reply, JoinReply::Success);
    assert_eq!(opts.traffic, Traffic::RawReliable);

    let fd_a = a.take_session_fd(id).expect("binder got no descriptor");
    let fd_b = b.take_session_fd(id).expect("joiner got no descriptor");
    // The descriptor moves out exactly once.
    assert!(a.take_session_fd(id).is_none());

    let mut sock_a = std::os::unix::net::UnixStream::from(fd_a);
    let mut sock_b = std::os::unix::net::UnixStream::from(fd_b);
    sock_a.write_all(b"raw bytes").unwrap();
    let mut buf = [0u8; 9];
    sock_b.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"raw bytes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(30000)]
async fn bind_rejects_bad_opts_and_duplicates() {
    init_logging();
    let network = InProcessNetwork::new();
    let bus = start_bus(&network);
    let a = bus.attach(true);

    let mut raw_multipoint = SessionOpts::raw_reliable_point_to_point();
    raw_multipoint.is_multipoint = true;
    let (code, _) = a.bind_session_port(42, raw_multipoint).await;
    assert_eq!(code, 4); // InvalidOpts

    let (code, _) = a
        .bind_session_port(42, SessionOpts::messages_point_to_point())
        .await;
    assert_eq!(code, SUCCESS);
    let (code, _) = a
        .bind_session_port(42, SessionOpts::messages_point_to_point())
        .await;
    assert_eq!(code, 2); // AlreadyExists

    // SESSION_PORT_ANY sweeps up from the dynamic range.
    let (code, port) = a
        .bind_session_port(0, SessionOpts::messages_point_to_point())
        .await;
    assert_eq!(code, SUCCESS);
    assert_eq!(port, 10_000);

    assert_eq!(a.unbind_session_port(42).await, SUCCESS);
    // Second unbind has nothing to remove.
    assert_eq!(a.unbind_session_port(42).await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(30000)]
async fn duplicate_cancels_fail_without_crashing() {
    init_logging();
    let network = InProcessNetwork::new();
    let bus = start_bus(&network);
    let a = bus.attach(true);

    assert_eq!(
        a.advertise_name("org.acme.svc", BitFlags::all()).await,
        SUCCESS
    );
    assert_eq!(
        a.advertise_name("org.acme.svc", BitFlags::all()).await,
        2 // AlreadyAdvertising
    );
    assert_eq!(
        a.cancel_advertise_name("org.acme.svc", BitFlags::all()).await,
        SUCCESS
    );
    assert_eq!(
        a.cancel_advertise_name("org.acme.svc", BitFlags::all()).await,
        2 // Failed
    );

    assert_eq!(a.find_advertised_name("org.acme.").await, SUCCESS);
    assert_eq!(a.find_advertised_name("org.acme.").await, 2); // AlreadyDiscovering
    assert_eq!(a.cancel_find_advertised_name("org.acme.").await, SUCCESS);
    assert_eq!(a.cancel_find_advertised_name("org.acme.").await, 2); // Failed
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(30000)]
async fn join_leave_round_trip_restores_state() {
    init_logging();
    let network = InProcessNetwork::new();
    let bus = start_bus(&network);

    let a = bus.attach(true);
    let b = bus.attach(true);
    let a_name = a.unique_name().to_string();

    a.bind_session_port(42, SessionOpts::messages_point_to_point())
        .await;
    let names_before = {
        let mut names = bus.router().names().unique_names();
        names.sort();
        names
    };

    let (reply, id, _) = b
        .join_session(&a_name, 42, SessionOpts::messages_point_to_point())
        .await;
    assert_eq!(reply, JoinReply::Success);
    assert_eq!(bus.sessions().session_count(), 2);
    assert!(bus.router().has_session_routes(id));

    assert_eq!(b.leave_session(id).await, SUCCESS);
    assert_eq!(bus.sessions().session_count(), 0);
    assert!(!bus.router().has_session_routes(id));
    let names_after = {
        let mut names = bus.router().names().unique_names();
        names.sort();
        names
    };
    assert_eq!(names_before, names_after);

    // Leaving twice: the session is gone.
    assert_eq!(b.leave_session(id).await, 2); // NoSession
}
