use std::time::Duration;
use anyhow::Result;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, QoS, SubscribeReasonCode};
use tokio::time;
use tracing::{debug, error, info, warn};

/// Incoming traffic worth reporting. Pings, acks for our own publishes and
/// the rest of the protocol chatter are left to rumqttc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Connected(ConnectReturnCode),
    Subscribed(Vec<SubscribeReasonCode>),
    Message { topic: String, payload: String },
}

pub fn classify(event: &Event) -> Option<Inbound> {
    match event {
        Event::Incoming(Packet::ConnAck(connack)) => Some(Inbound::Connected(connack.code)),
        Event::Incoming(Packet::SubAck(suback)) => Some(Inbound::Subscribed(suback.return_codes.clone())),
        Event::Incoming(Packet::Publish(publish)) => Some(Inbound::Message {
            topic: publish.topic.clone(),
            payload: String::from_utf8_lossy(&publish.payload).into_owned(),
        }),
        _ => None,
    }
}

/// Polls the connection until our DISCONNECT has gone out. The status topic
/// is (re)subscribed after every successful CONNACK, since the session is clean.
pub async fn drive(mut eventloop: EventLoop, client: AsyncClient, status_topic: String, qos: QoS) -> Result<()> {
    loop {
        let event = match eventloop.poll().await {
            Ok(event) => event,
            Err(e) => {
                error!(error = ?e, "MQTT connection error");
                time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };
        if let Event::Outgoing(Outgoing::Disconnect) = event {
            info!("Disconnected from broker");
            return Ok(());
        }
        match classify(&event) {
            Some(Inbound::Connected(code)) => {
                info!(?code, "Connected");
                if code == ConnectReturnCode::Success {
                    subscribe_status(&client, &status_topic, qos);
                }
            },
            Some(Inbound::Subscribed(granted)) => {
                if granted.iter().any(|code| matches!(code, SubscribeReasonCode::Failure)) {
                    warn!(?granted, "Subscription refused");
                } else {
                    info!(?granted, "Subscribed");
                }
            },
            Some(Inbound::Message { topic, payload }) => {
                info!(%topic, %payload, "Message");
            },
            None => debug!(?event, "Event"),
        }
    }
}

/// Never waits on the request queue: this task is the only one draining it.
fn subscribe_status(client: &AsyncClient, topic: &str, qos: QoS) {
    if client.try_subscribe(topic, qos).is_ok() {
        debug!(%topic, ?qos, "Subscribe requested");
        return;
    }
    warn!(%topic, "Request queue full, subscribe will follow the pending publishes");
    let client = client.clone();
    let topic = topic.to_owned();
    tokio::spawn(async move {
        if let Err(err) = client.subscribe(topic.as_str(), qos).await {
            error!(error = ?err, %topic, "Could not request status subscription");
        }
    });
}

/// Asks the event loop to send DISCONNECT. Gives up after `grace` when the
/// request queue stays full, e.g. while the broker is unreachable.
pub async fn request_disconnect(client: &AsyncClient, grace: Duration) {
    match time::timeout(grace, client.disconnect()).await {
        Ok(Ok(())) => debug!("Disconnect requested"),
        Ok(Err(err)) => warn!(error = ?err, "Could not request disconnect"),
        Err(_) => warn!("Request queue stayed full, giving up on DISCONNECT"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, MqttOptions, Publish, SubAck};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn connack_reports_return_code() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)));
        assert_eq!(classify(&event), Some(Inbound::Connected(ConnectReturnCode::Success)));

        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::NotAuthorized, false)));
        assert_eq!(classify(&event), Some(Inbound::Connected(ConnectReturnCode::NotAuthorized)));
    }

    #[test]
    fn suback_reports_granted_qos() {
        let granted = vec![SubscribeReasonCode::Success(QoS::AtMostOnce), SubscribeReasonCode::Failure];
        let event = Event::Incoming(Packet::SubAck(SubAck::new(1, granted.clone())));
        assert_eq!(classify(&event), Some(Inbound::Subscribed(granted)));
    }

    #[test]
    fn publish_is_reported_with_lossy_payload() {
        let publish = Publish::new("zink/dce/test01/json/status", QoS::AtMostOnce, b"ok \xff".to_vec());
        assert_eq!(
            classify(&Event::Incoming(Packet::Publish(publish))),
            Some(Inbound::Message {
                topic: "zink/dce/test01/json/status".into(),
                payload: "ok \u{fffd}".into(),
            })
        );
    }

    #[test]
    fn protocol_chatter_is_ignored() {
        assert_eq!(classify(&Event::Incoming(Packet::PingResp)), None);
        assert_eq!(classify(&Event::Outgoing(Outgoing::PingReq)), None);
        assert_eq!(classify(&Event::Outgoing(Outgoing::Publish(1))), None);
    }

    const STATUS: &str = "zink/dce/test01/json/status";
    const STEP: Duration = Duration::from_secs(5);

    /// Reads one MQTT packet, returning the fixed header byte and the body.
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Accepts the next client, reads its CONNECT and answers with `code`.
    async fn accept(listener: &TcpListener, code: u8) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header, 0x10, "expected CONNECT");
        stream.write_all(&[0x20, 0x02, 0x00, code]).await.unwrap();
        stream
    }

    /// Skips everything up to the next SUBSCRIBE and returns its filter and QoS.
    async fn next_subscribe(stream: &mut TcpStream) -> (String, u8) {
        loop {
            let (header, body) = read_packet(stream).await.unwrap();
            if header == 0x82 {
                let len = u16::from_be_bytes([body[2], body[3]]) as usize;
                let topic = String::from_utf8(body[4..4 + len].to_vec()).unwrap();
                return (topic, body[4 + len]);
            }
        }
    }

    async fn broker() -> (TcpListener, AsyncClient, EventLoop) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("dce-sim-test", "127.0.0.1", port), 10);
        (listener, client, eventloop)
    }

    #[tokio::test]
    async fn subscribes_at_configured_qos_and_stops_on_disconnect() {
        let (listener, client, eventloop) = broker().await;
        let driver = tokio::spawn(drive(eventloop, client.clone(), STATUS.into(), QoS::AtLeastOnce));

        let mut session = time::timeout(STEP, accept(&listener, 0)).await.unwrap();
        let subscribed = time::timeout(STEP, next_subscribe(&mut session)).await.unwrap();
        assert_eq!(subscribed, (STATUS.to_string(), 1));

        request_disconnect(&client, STEP).await;
        time::timeout(STEP, driver).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_retried_without_subscribing() {
        let (listener, client, eventloop) = broker().await;
        let driver = tokio::spawn(drive(eventloop, client, STATUS.into(), QoS::AtMostOnce));

        for _ in 0..2 {
            let mut session = time::timeout(STEP, accept(&listener, 5)).await.unwrap();
            let after = time::timeout(Duration::from_secs(1), read_packet(&mut session)).await;
            assert!(!matches!(after, Ok(Ok((0x82, _)))), "subscribed on a refused connection");
        }
        driver.abort();
    }

    #[tokio::test]
    async fn resubscribes_after_reconnect() {
        let (listener, client, eventloop) = broker().await;
        let driver = tokio::spawn(drive(eventloop, client, STATUS.into(), QoS::AtMostOnce));

        let mut first = time::timeout(STEP, accept(&listener, 0)).await.unwrap();
        assert_eq!(time::timeout(STEP, next_subscribe(&mut first)).await.unwrap().0, STATUS);
        drop(first);

        let mut second = time::timeout(STEP, accept(&listener, 0)).await.unwrap();
        assert_eq!(time::timeout(STEP, next_subscribe(&mut second)).await.unwrap().0, STATUS);
        driver.abort();
    }

    #[tokio::test]
    async fn subscribes_behind_a_full_request_queue() {
        let (listener, client, eventloop) = broker().await;
        for i in 0..10u8 {
            client.publish("zink/dce/test01/json", QoS::AtMostOnce, false, vec![i]).await.unwrap();
        }
        let driver = tokio::spawn(drive(eventloop, client.clone(), STATUS.into(), QoS::AtMostOnce));

        let mut session = time::timeout(STEP, accept(&listener, 0)).await.unwrap();
        let subscribed = time::timeout(STEP, next_subscribe(&mut session)).await.expect("no SUBSCRIBE behind the queued publishes");
        assert_eq!(subscribed.0, STATUS);

        request_disconnect(&client, STEP).await;
        time::timeout(STEP, driver).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn disconnect_request_gives_up_on_a_full_queue() {
        let (_listener, client, _eventloop) = broker().await;
        for i in 0..10u8 {
            client.publish("zink/dce/test01/json", QoS::AtMostOnce, false, vec![i]).await.unwrap();
        }
        time::timeout(Duration::from_secs(2), request_disconnect(&client, Duration::from_millis(100)))
            .await
            .expect("disconnect request blocked past its grace period");
    }
}
