use duplink::device::{
    Device,
    Error,
};
use std::{
    sync::{
        Arc,
        Mutex,
    },
    time::{
        Duration,
        Instant,
    },
};
use tokio::time;

type Recorded = Arc<Mutex<Vec<Vec<u8>>>>;

async fn paired_devices() -> (Device, Device) {
    let listener = Device::listen(([127, 0, 0, 1], 0))
        .await
        .expect("passive device bound");

    let listener_addr = listener.local_addr().expect("local address");

    let device = Device::connect(([127, 0, 0, 1], 0), listener_addr)
        .await
        .expect("active device connected");

    (listener, device)
}

fn recording_parser(device: &Device, message_type: u8) -> Recorded {
    let received: Recorded = Arc::default();
    let record = received.clone();

    device
        .register_parser(message_type, move |_, payload| {
            record.lock().unwrap().push(payload.to_vec());
        })
        .expect("parser registered");

    received
}

async fn wait_for_count(received: &Recorded, expected: usize) {
    for _ in 0 .. 500 {
        if received.lock().unwrap().len() >= expected {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }

    panic!(
        "expected {} messages, got {}",
        expected,
        received.lock().unwrap().len()
    );
}

#[tokio::test]
async fn round_trip() {
    let _ = env_logger::try_init();

    let (listener, device) = paired_devices().await;
    let received = recording_parser(&listener, 43);

    // A second registration is rejected and must not displace the first.
    assert!(matches!(
        listener.register_parser(43, |_, _| panic!("displaced parser")),
        Err(Error::AlreadyRegistered)
    ));

    device
        .send_reliable(43, &[0x01, 0x02, 0x03])
        .await
        .expect("reliable send");

    wait_for_count(&received, 1).await;
    // Nothing else may trickle in afterwards.
    time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        received.lock().unwrap().as_slice(),
        &[vec![0x01, 0x02, 0x03]]
    );

    device.close();
    listener.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn ordering_under_concurrency() {
    let _ = env_logger::try_init();

    let (listener, device) = paired_devices().await;
    let received = recording_parser(&listener, 43);

    let mut senders = Vec::new();

    for tag in 0u8 .. 2 {
        let device = device.clone();

        senders.push(tokio::spawn(async move {
            for i in 0u8 .. 10 {
                device
                    .send_reliable(43, &[tag, i])
                    .await
                    .expect("reliable send");
            }
        }));
    }

    for sender in senders {
        sender.await.expect("sender task");
    }

    wait_for_count(&received, 20).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 20);

    // Dispatch order per sending task equals its send order, and every
    // message arrives exactly once.
    for tag in 0u8 .. 2 {
        let ordered = received
            .iter()
            .filter(|payload| payload[0] == tag)
            .map(|payload| payload[1])
            .collect::<Vec<_>>();

        assert_eq!(ordered, (0u8 .. 10).collect::<Vec<_>>());
    }

    drop(received);
    device.close();
    listener.close();
}

#[tokio::test]
async fn passive_side_learns_its_peer() {
    let _ = env_logger::try_init();

    let (listener, device) = paired_devices().await;
    let to_listener = recording_parser(&listener, 43);
    let to_device = recording_parser(&device, 44);

    assert!(listener.is_connected());
    assert_eq!(listener.remote_addr(), Some(device.local_addr().unwrap()));

    device
        .send_reliable(43, &[0xAA])
        .await
        .expect("reliable send to the passive side");

    wait_for_count(&to_listener, 1).await;
    assert_eq!(to_listener.lock().unwrap().as_slice(), &[vec![0xAA]]);

    // The passive side can answer because the handshake bound its peer.
    listener
        .send_reliable(44, &[0xBB])
        .await
        .expect("reliable send back");

    wait_for_count(&to_device, 1).await;
    assert_eq!(to_device.lock().unwrap().as_slice(), &[vec![0xBB]]);

    device.close();
    listener.close();
}

#[tokio::test]
async fn timeout_budget() {
    let _ = env_logger::try_init();

    let (listener, device) = paired_devices().await;

    // A closed peer acknowledges nothing.
    listener.close();

    let started = Instant::now();
    let result = device
        .send_reliable_with(43, &[0xFF], 3, Duration::from_millis(50))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(Error::Timeout)));
    assert!(elapsed >= Duration::from_millis(150), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300), "{:?}", elapsed);

    device.close();
}

#[tokio::test]
async fn oversize_payload_rejected() {
    let _ = env_logger::try_init();

    let (listener, device) = paired_devices().await;
    let received = recording_parser(&listener, 43);

    let payload = [0u8; duplink::MAX_MESSAGE_SIZE + 1];

    assert!(matches!(
        device.send_reliable(43, &payload).await,
        Err(Error::MessageTooLarge)
    ));
    assert!(matches!(
        device.send_unreliable(43, &payload).await,
        Err(Error::MessageTooLarge)
    ));

    // Nothing was transmitted.
    time::sleep(Duration::from_millis(100)).await;
    assert!(received.lock().unwrap().is_empty());

    device.close();
    listener.close();
}
