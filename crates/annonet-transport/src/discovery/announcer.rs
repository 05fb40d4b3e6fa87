//! Periodic server announcements.
//!
//! One UDP sender per broadcast target. Each tick sends an
//! [`Announcement`] carrying that target's local address, so a client on
//! any subnet learns an address it can actually reach.

use std::net::SocketAddr;
use std::time::Duration;

use annonet_core::{Announcement, JsonMessage};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::interfaces::BroadcastTarget;
use crate::socket::UdpSender;

/// What every announcement carries apart from the per-target address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceParams {
    pub text: String,
    pub name: String,
    pub port: u16,
}

pub struct Announcer {
    target: BroadcastTarget,
    sender: UdpSender,
}

impl Announcer {
    fn announcement(&self, params: &AnnounceParams) -> Announcement {
        Announcement {
            ip: self.target.local.to_string(),
            port: params.port,
            name: params.name.clone(),
            message: params.text.clone(),
        }
    }
}

/// Open one sender per target. Targets whose socket cannot be opened are
/// logged and skipped.
pub fn open_announcers(targets: &[BroadcastTarget], discovery_port: u16) -> Vec<Announcer> {
    targets
        .iter()
        .filter_map(|&target| {
            let mut sender = UdpSender::new(SocketAddr::from((target.broadcast, discovery_port)));
            match sender.open() {
                Ok(()) => Some(Announcer { target, sender }),
                Err(e) => {
                    tracing::warn!(broadcast = %target.broadcast, error = %e, "announce socket failed");
                    None
                }
            }
        })
        .collect()
}

/// Send one announcement through every sender. A sender found closed is
/// reopened and skipped for this round.
pub fn announce_once(announcers: &mut [Announcer], params: &AnnounceParams) -> usize {
    let mut sent = 0;
    for announcer in announcers.iter_mut() {
        if !announcer.sender.is_open() {
            if let Err(e) = announcer.sender.open() {
                tracing::warn!(target = %announcer.sender.target(), error = %e, "announce socket reopen failed");
            }
            continue;
        }

        let envelope = match announcer.announcement(params).pack() {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode announcement");
                continue;
            }
        };
        match announcer.sender.send(&envelope.serialize()) {
            Ok(bytes) => {
                sent += 1;
                tracing::trace!(target = %announcer.sender.target(), bytes, "announced");
            }
            Err(e) => {
                tracing::warn!(target = %announcer.sender.target(), error = %e, "announce failed");
            }
        }
    }
    sent
}

/// Announce after `delay`, then every `interval`, until shutdown.
pub async fn announce_loop(
    mut announcers: Vec<Announcer>,
    params: AnnounceParams,
    delay: Duration,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(
        targets = announcers.len(),
        port = params.port,
        name = %params.name,
        "announcing server"
    );

    let mut ticker = interval_at(Instant::now() + delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                tracing::debug!("announce loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                announce_once(&mut announcers, &params);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annonet_core::{Envelope, MessageType};
    use std::net::Ipv4Addr;
    use tokio::net::UdpSocket;

    fn loopback_target() -> BroadcastTarget {
        BroadcastTarget {
            broadcast: Ipv4Addr::LOCALHOST,
            local: Ipv4Addr::LOCALHOST,
        }
    }

    fn params() -> AnnounceParams {
        AnnounceParams {
            text: "TTD".into(),
            name: "box".into(),
            port: 4242,
        }
    }

    #[tokio::test]
    async fn announcement_carries_target_local_address() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut announcers = open_announcers(&[loopback_target()], port);
        assert_eq!(announce_once(&mut announcers, &params()), 1);

        let mut buf = [0u8; 1024];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), listener.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let envelope = Envelope::deserialize(Some(from), &buf[..n]).unwrap();
        assert_eq!(envelope.msg_type, MessageType::ANNOUNCEMENT);

        let announcement = Announcement::unpack(&envelope).unwrap();
        assert_eq!(announcement.ip, "127.0.0.1");
        assert_eq!(announcement.port, 4242);
        assert_eq!(announcement.name, "box");
        assert_eq!(announcement.message, "TTD");
    }

    #[tokio::test]
    async fn closed_sender_is_reopened_next_round() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut announcers = open_announcers(&[loopback_target()], port);
        announcers[0].sender.close();

        assert_eq!(announce_once(&mut announcers, &params()), 0);
        assert!(announcers[0].sender.is_open());
        assert_eq!(announce_once(&mut announcers, &params()), 1);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let announcers = open_announcers(&[loopback_target()], 9);
        let task = tokio::spawn(announce_loop(
            announcers,
            params(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            rx,
        ));
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
