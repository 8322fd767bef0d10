//! Serial link tests over a scripted connector, with tokio's clock paused so
//! backoff and banner windows run instantly.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use rfidisk_core::{DeviceEvent, LinkConfig, LinkEvent, SerialLink, TagId};
use rfidisk_test_utils::ScriptedConnector;

fn config() -> LinkConfig {
    LinkConfig {
        settle: Duration::ZERO,
        ..LinkConfig::default()
    }
}

fn tag(id: &str) -> TagId {
    TagId::parse(id).unwrap()
}

/// Poll `cond` on the paused clock until it holds.
async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test(start_paused = true)]
async fn decodes_lines_under_the_connection_epoch() {
    let connector = Arc::new(ScriptedConnector::new());
    let feed = connector.push_device();
    let cancel = CancellationToken::new();
    let mut link = SerialLink::with_connector(connector.clone(), config()).start(None, cancel.clone());

    assert_eq!(link.events.next().await, Some(LinkEvent::Connected { epoch: 1 }));

    feed.send_line("RFIDisk firmware booting");
    feed.send_line("ON:1D0DC0070D1080");
    feed.send_line("OF:1d0dc0070d1080");
    assert_eq!(
        link.events.next().await,
        Some(LinkEvent::Device {
            epoch: 1,
            event: DeviceEvent::TagOn(tag("1d0dc0070d1080")),
        })
    );
    assert_eq!(
        link.events.next().await,
        Some(LinkEvent::Device {
            epoch: 1,
            event: DeviceEvent::TagOff(tag("1d0dc0070d1080")),
        })
    );

    cancel.cancel();
    link.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn boot_banner_is_discarded_but_later_ready_is_reported() {
    let connector = Arc::new(ScriptedConnector::new());
    let feed = connector.push_device();
    let cancel = CancellationToken::new();
    let mut link = SerialLink::with_connector(connector.clone(), config()).start(None, cancel.clone());

    assert_eq!(link.events.next().await, Some(LinkEvent::Connected { epoch: 1 }));
    feed.send_line("OK");
    feed.send_line("ON:cafe");
    assert_eq!(
        link.events.next().await,
        Some(LinkEvent::Device {
            epoch: 1,
            event: DeviceEvent::TagOn(tag("cafe")),
        })
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    feed.send_line("OK");
    assert_eq!(
        link.events.next().await,
        Some(LinkEvent::Device {
            epoch: 1,
            event: DeviceEvent::Ready,
        })
    );

    cancel.cancel();
    link.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_increments_epoch() {
    let connector = Arc::new(ScriptedConnector::new());
    let first = connector.push_device();
    connector.push_failure();
    connector.push_failure();
    let second = connector.push_device();

    let cancel = CancellationToken::new();
    let mut link = SerialLink::with_connector(connector.clone(), config()).start(None, cancel.clone());
    assert_eq!(link.events.next().await, Some(LinkEvent::Connected { epoch: 1 }));

    first.close();
    assert_eq!(link.events.next().await, Some(LinkEvent::Disconnected { epoch: 1 }));
    assert!(!link.handle.state().connected);

    let started = tokio::time::Instant::now();
    assert_eq!(link.events.next().await, Some(LinkEvent::Connected { epoch: 2 }));
    // Two failures: waits of about 1s and 2s.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(connector.attempts(), 4);
    assert_eq!(link.handle.state().epoch, 2);

    second.send_line("ON:04aabbcc");
    assert_eq!(
        link.events.next().await,
        Some(LinkEvent::Device {
            epoch: 2,
            event: DeviceEvent::TagOn(tag("04aabbcc")),
        })
    );

    cancel.cancel();
    link.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn writes_reach_the_device_only_while_connected() {
    let connector = Arc::new(ScriptedConnector::new());
    let feed = connector.push_device();
    let cancel = CancellationToken::new();
    let mut link = SerialLink::with_connector(connector.clone(), config()).start(None, cancel.clone());

    // Nothing is connected before the first Connected event.
    assert!(!link.handle.send("D|early||||0"));

    assert_eq!(link.events.next().await, Some(LinkEvent::Connected { epoch: 1 }));
    assert!(link.handle.send("D|Ready|Insert Disk|||0"));
    eventually(|| connector.written() == vec!["D|Ready|Insert Disk|||0".to_string()]).await;

    feed.close();
    assert_eq!(link.events.next().await, Some(LinkEvent::Disconnected { epoch: 1 }));
    assert!(!link.handle.send("D|lost||||0"));

    cancel.cancel();
    link.task.await.unwrap();
    assert_eq!(connector.written().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn busy_consumer_does_not_stall_the_link() {
    let connector = Arc::new(ScriptedConnector::new());
    let feed = connector.push_device();
    let cancel = CancellationToken::new();
    let mut link = SerialLink::with_connector(connector.clone(), config()).start(None, cancel.clone());
    assert_eq!(link.events.next().await, Some(LinkEvent::Connected { epoch: 1 }));

    // Nobody reads events for a while.
    for _ in 0..200 {
        feed.send_line("ON:cafe");
        feed.send_line("OF:cafe");
    }
    eventually(|| link.handle.state().last_seen.is_some()).await;
    assert!(link.handle.send("D|DOOM|GZDoom Engine|1993|id Software|1"));
    eventually(|| connector.written().len() == 1).await;

    let mut received = 0;
    while received < 400 {
        match link.events.next().await {
            Some(LinkEvent::Device { epoch: 1, .. }) => received += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }

    cancel.cancel();
    link.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silence_past_liveness_timeout_disconnects() {
    let connector = Arc::new(ScriptedConnector::new());
    let _feed = connector.push_device();
    let config = LinkConfig {
        liveness_timeout: Some(Duration::from_secs(5)),
        ..config()
    };
    let cancel = CancellationToken::new();
    let mut link = SerialLink::with_connector(connector.clone(), config).start(None, cancel.clone());

    assert_eq!(link.events.next().await, Some(LinkEvent::Connected { epoch: 1 }));
    let started = tokio::time::Instant::now();
    assert_eq!(link.events.next().await, Some(LinkEvent::Disconnected { epoch: 1 }));
    assert!(started.elapsed() >= Duration::from_secs(5));

    cancel.cancel();
    link.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn open_reports_missing_device_and_start_uses_given_connection() {
    let connector = Arc::new(ScriptedConnector::new());
    let link = SerialLink::with_connector(connector.clone(), config());
    assert!(link.open().await.is_err());

    connector.push_device();
    let device = link.open().await.unwrap();
    let cancel = CancellationToken::new();
    let mut running = link.start(Some(device), cancel.clone());
    assert_eq!(running.events.next().await, Some(LinkEvent::Connected { epoch: 1 }));
    assert_eq!(connector.attempts(), 2);

    cancel.cancel();
    running.task.await.unwrap();
    assert_eq!(running.events.next().await, None);
}
