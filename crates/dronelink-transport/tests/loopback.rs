//! Integration tests for the loopback link driver.
//!
//! These drive both halves of an in-memory endpoint: the link handed out by
//! the resolver and the peer that stands in for the vehicle.

#[cfg(feature = "loopback")]
mod loopback {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use dronelink_transport::{
        LinkCallbacks, LinkDriver, LinkError, LinkResolver, LoopbackResolver,
    };

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_open_send_and_receive() {
        let resolver = LoopbackResolver::new();
        let peer = resolver.endpoint("bench");

        let link = resolver
            .open(&peer.uri(), LinkCallbacks::noop())
            .await
            .expect("open should not error")
            .expect("endpoint should resolve");
        assert!(peer.is_open());
        assert!(link.needs_resending());

        // --- Link sends, peer receives ---
        link.send(&[0x30, 1, 2, 0x33]).await.expect("send should succeed");
        assert_eq!(peer.recv_sent(WAIT).await, Some(vec![0x30, 1, 2, 0x33]));

        // --- Peer injects, link receives ---
        peer.inject(vec![0x0C, 0x0C]);
        let frame = link.recv(WAIT).await.expect("recv should succeed");
        assert_eq!(frame, Some(vec![0x0C, 0x0C]));

        link.close().await.expect("close should succeed");
        assert!(!peer.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_times_out_with_none() {
        let resolver = LoopbackResolver::new();
        let peer = resolver.endpoint("quiet");
        let link = resolver
            .open(&peer.uri(), LinkCallbacks::noop())
            .await
            .unwrap()
            .unwrap();

        let frame = link.recv(Duration::from_secs(1)).await.unwrap();
        assert!(frame.is_none(), "nothing was injected");
    }

    #[tokio::test]
    async fn test_unknown_scheme_and_name_resolve_to_none() {
        let resolver = LoopbackResolver::new();
        resolver.endpoint("known");

        for uri in ["bogus://unsupported", "loopback://unknown", "not a uri"] {
            let link = resolver.open(uri, LinkCallbacks::noop()).await.unwrap();
            assert!(link.is_none(), "{uri} should not resolve");
        }
    }

    #[tokio::test]
    async fn test_fail_next_open_errors_once() {
        let resolver = LoopbackResolver::new();
        let peer = resolver.endpoint("flaky");
        peer.fail_next_open("radio busy");

        let first = resolver.open(&peer.uri(), LinkCallbacks::noop()).await;
        assert!(matches!(first, Err(LinkError::OpenFailed(msg)) if msg == "radio busy"));

        let second = resolver.open(&peer.uri(), LinkCallbacks::noop()).await;
        assert!(matches!(second, Ok(Some(_))));
        assert_eq!(peer.open_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_link_rejects_send_and_recv() {
        let resolver = LoopbackResolver::new();
        let peer = resolver.endpoint("shut");
        let link = resolver
            .open(&peer.uri(), LinkCallbacks::noop())
            .await
            .unwrap()
            .unwrap();

        link.close().await.unwrap();
        // Closing twice is fine.
        link.close().await.unwrap();

        assert!(matches!(link.send(&[0, 0]).await, Err(LinkError::ConnectionClosed(_))));
        assert!(matches!(link.recv(WAIT).await, Err(LinkError::ConnectionClosed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_pending_recv_without_taking_a_frame() {
        let resolver = LoopbackResolver::new();
        let peer = resolver.endpoint("reopen");
        let link = Arc::new(
            resolver
                .open(&peer.uri(), LinkCallbacks::noop())
                .await
                .unwrap()
                .unwrap(),
        );

        let waiting = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.recv(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        link.close().await.unwrap();
        let ended = waiting.await.unwrap();
        assert!(matches!(ended, Err(LinkError::ConnectionClosed(_))));

        // The next frame belongs to the reopened link.
        let reopened = resolver
            .open(&peer.uri(), LinkCallbacks::noop())
            .await
            .unwrap()
            .unwrap();
        peer.inject(vec![0x0C, 0x0C]);
        assert_eq!(reopened.recv(WAIT).await.unwrap(), Some(vec![0x0C, 0x0C]));
    }

    #[tokio::test]
    async fn test_peer_fires_callbacks_of_open_link() {
        let resolver = LoopbackResolver::new();
        let peer = resolver.endpoint("noisy");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (q, e) = (Arc::clone(&seen), Arc::clone(&seen));
        let callbacks = LinkCallbacks::new(
            move |pct| q.lock().unwrap().push(format!("quality {pct}")),
            move |msg| e.lock().unwrap().push(format!("error {msg}")),
        );

        let link = resolver.open(&peer.uri(), callbacks).await.unwrap().unwrap();
        peer.report_quality(42.0);
        peer.raise_error("antenna fell off");

        link.close().await.unwrap();
        // After close the callbacks are detached.
        peer.raise_error("too late");

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["quality 42".to_string(), "error antenna fell off".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reliable_endpoint_does_not_need_resending() {
        let resolver = LoopbackResolver::new();
        let peer = resolver.reliable_endpoint("usb");
        let link = resolver
            .open(&peer.uri(), LinkCallbacks::noop())
            .await
            .unwrap()
            .unwrap();
        assert!(!link.needs_resending());
    }

    #[tokio::test]
    async fn test_drain_sent_collects_in_order() {
        let resolver = LoopbackResolver::new();
        let peer = resolver.endpoint("order");
        let link = resolver
            .open(&peer.uri(), LinkCallbacks::noop())
            .await
            .unwrap()
            .unwrap();

        for i in 0..3u8 {
            link.send(&[i, i]).await.unwrap();
        }
        assert_eq!(peer.drain_sent().await, vec![vec![0, 0], vec![1, 1], vec![2, 2]]);
        assert!(peer.drain_sent().await.is_empty());
    }
}
