use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ajbusd::{
    attachment::Attachment,
    bus::{Bus, BusState},
    codec::{Message, SessionOpts, TransportMask},
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

async fn start_router(network: &InProcessNetwork) -> Arc<BusState> {
    let mut bus = Bus::new(Config::default(), network.node()).unwrap();
    let state = bus.state().clone();
    state
        .listen()
        .start_listen("tcp:r4addr=127.0.0.1,r4port=0".parse().unwrap())
        .await;
    tokio::spawn(async move {
        let _ = bus.run().await;
    });
    state
}

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

/// Bind + own + advertise a name on `bus`, returning the service
/// attachment.
async fn publish_service(bus: &Arc<BusState>, name: &str, port: u16, opts: SessionOpts) -> Attachment {
    let service = bus.attach(true);
    let (code, _) = service.bind_session_port(port, opts).await;
    assert_eq!(code, SUCCESS);
    assert_eq!(service.request_name(name, BitFlags::empty()).await, 1);
    assert_eq!(
        service
            .advertise_name(name, TransportMask::Tcp.into())
            .await,
        SUCCESS
    );
    service
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(60000)]
async fn advertisement_replay_reaches_late_finder() {
    init_logging();
    let network = InProcessNetwork::new();
    let r1 = start_router(&network).await;
    let r2 = start_router(&network).await;

    let _service = publish_service(
        &r2,
        "org.acme.svc.1",
        42,
        SessionOpts::messages_point_to_point(),
    )
    .await;

    // First finder populates R1's name map through a who-has probe.
    let scout = r1.attach(true);
    assert_eq!(scout.find_advertised_name("org.acme.svc.").await, SUCCESS);
    let found = wait_for(&scout, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("FoundAdvertisedName")
    })
    .await
    .expect("scout never found the service");
    assert_eq!(found.arg_str(0).unwrap(), "org.acme.svc.1");

    // A late finder gets the live entry replayed without any new packet
    // from the advertiser.
    let late = r1.attach(true);
    let asked = Instant::now();
    assert_eq!(late.find_advertised_name("org.acme.svc.").await, SUCCESS);
    let replayed = wait_for(&late, Duration::from_secs(1), |m| {
        m.member.as_deref() == Some("FoundAdvertisedName")
    })
    .await
    .expect("late finder missed the replay");
    assert!(asked.elapsed() < Duration::from_millis(200));
    assert_eq!(replayed.arg_str(0).unwrap(), "org.acme.svc.1");
    assert_eq!(replayed.arg_str(2).unwrap(), "org.acme.svc.");
    // Exactly one replay per live entry.
    assert!(wait_for(&late, Duration::from_millis(300), |m| {
        m.member.as_deref() == Some("FoundAdvertisedName")
    })
    .await
    .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(60000)]
async fn cross_router_session_lifecycle() {
    init_logging();
    let network = InProcessNetwork::new();
    let r1 = start_router(&network).await;
    let r2 = start_router(&network).await;

    let service = publish_service(
        &r2,
        "org.acme.svc.chat",
        42,
        SessionOpts::messages_point_to_point(),
    )
    .await;

    let client = r1.attach(true);
    assert_eq!(
        client.find_advertised_name("org.acme.svc.").await,
        SUCCESS
    );
    assert!(wait_for(&client, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("FoundAdvertisedName")
    })
    .await
    .is_some());

    let (reply, id, _) = client
        .join_session(
            "org.acme.svc.chat",
            42,
            SessionOpts::messages_point_to_point(),
        )
        .await;
    assert_eq!(reply, JoinReply::Success);
    assert_ne!(id, 0);

    // The binder on R2 observes the remote join.
    let joined = wait_for(&service, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("SessionJoined")
    })
    .await
    .expect("binder never saw the remote join");
    assert_eq!(joined.arg_u32(1).unwrap(), id);
    assert_eq!(joined.arg_str(2).unwrap(), client.unique_name());

    // After the name exchange each router can resolve the other side's
    // attachment, and nothing ever echoed back as ours.
    assert!(r2
        .router()
        .names()
        .unique_name_exists(client.unique_name()));
    assert!(r1
        .router()
        .names()
        .unique_name_exists(service.unique_name()));

    // Session traffic flows R1 -> R2, each copy delivered once, and the
    // detach never overtakes data queued before it.
    for serial in 0..3u32 {
        client
            .send_session_signal(
                id,
                "org.test.chat",
                "Ping",
                vec![ajbusd::codec::Arg::U32(serial)],
            )
            .await
            .unwrap();
    }
    assert_eq!(client.leave_session(id).await, SUCCESS);

    for expected in 0..3u32 {
        let ping = wait_for(&service, Duration::from_secs(5), |m| {
            m.member.as_deref() == Some("Ping")
        })
        .await
        .unwrap_or_else(|| panic!("binder missed ping {expected}"));
        assert_eq!(ping.arg_u32(0).unwrap(), expected);
        assert_eq!(ping.session_id, id);
    }
    let lost = wait_for(&service, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("SessionLostWithReason")
    })
    .await
    .expect("binder never saw the session end");
    assert_eq!(lost.arg_u32(0).unwrap(), id);
    // RemoteEndLeft
    assert_eq!(lost.arg_u32(1).unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(60000)]
async fn quiet_advertisement_answers_probes_only() {
    init_logging();
    let network = InProcessNetwork::new();
    let r1 = start_router(&network).await;
    let r2 = start_router(&network).await;

    // A watcher already discovering the prefix must see nothing when the
    // quiet advertisement goes up.
    let watcher = r1.attach(true);
    assert_eq!(
        watcher.find_advertised_name("org.acme.router.").await,
        SUCCESS
    );

    let router_svc = r2.attach(true);
    assert_eq!(
        router_svc
            .advertise_name("quiet@org.acme.router.x", TransportMask::Tcp.into())
            .await,
        SUCCESS
    );
    assert!(
        wait_for(&watcher, Duration::from_millis(500), |m| {
            m.member.as_deref() == Some("FoundAdvertisedName")
        })
        .await
        .is_none(),
        "quiet advertisement produced a gratuitous announcement"
    );

    // A fresh probe elicits the response.
    let prober = r1.attach(true);
    assert_eq!(
        prober.find_advertised_name("org.acme.router.").await,
        SUCCESS
    );
    let found = wait_for(&prober, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("FoundAdvertisedName")
    })
    .await
    .expect("who-has probe got no answer");
    assert_eq!(found.arg_str(0).unwrap(), "org.acme.router.x");

    // Cancelling tells the probers the name is gone.
    assert_eq!(
        router_svc
            .cancel_advertise_name("quiet@org.acme.router.x", TransportMask::Tcp.into())
            .await,
        SUCCESS
    );
    assert!(wait_for(&prober, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("LostAdvertisedName")
    })
    .await
    .is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(90000)]
async fn cross_router_multipoint_membership() {
    init_logging();
    let network = InProcessNetwork::new();
    let r1 = start_router(&network).await;
    let r2 = start_router(&network).await;

    let host = publish_service(
        &r2,
        "org.acme.svc.room",
        42,
        SessionOpts::messages_multipoint(),
    )
    .await;

    // A local member on the host's router joins first.
    let local_member = r2.attach(true);
    let (reply, id, _) = local_member
        .join_session("org.acme.svc.room", 42, SessionOpts::messages_multipoint())
        .await;
    assert_eq!(reply, JoinReply::Success);

    // Then a remote member from R1.
    let remote_member = r1.attach(true);
    assert_eq!(
        remote_member.find_advertised_name("org.acme.svc.").await,
        SUCCESS
    );
    assert!(wait_for(&remote_member, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("FoundAdvertisedName")
    })
    .await
    .is_some());
    let (reply, remote_id, _) = remote_member
        .join_session("org.acme.svc.room", 42, SessionOpts::messages_multipoint())
        .await;
    assert_eq!(reply, JoinReply::Success);
    assert_eq!(remote_id, id);

    // The members already in are told about the newcomer.
    for (watcher, who) in [(&host, "host"), (&local_member, "local member")] {
        let seen = wait_for(watcher, Duration::from_secs(5), |m| {
            m.member.as_deref() == Some("MPSessionChanged")
                && m.arg_str(1).unwrap() == remote_member.unique_name()
                && m.arg(2).unwrap().as_bool() == Some(true)
        })
        .await;
        assert!(seen.is_some(), "{who} never saw the remote member join");
    }
    // The newcomer catches up on the host.
    assert!(wait_for(&remote_member, Duration::from_secs(5), |m| {
        m.member.as_deref() == Some("MPSessionChanged")
            && m.arg_str(1).unwrap() == host.unique_name()
    })
    .await
    .is_some());

    // A multicast from the remote member lands at host and local member,
    // once each.
    remote_member
        .send_session_signal(id, "org.test.chat", "Blast", vec![])
        .await
        .unwrap();
    for (watcher, who) in [(&host, "host"), (&local_member, "local member")] {
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
