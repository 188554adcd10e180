mod common;

use std::time::Duration;

use futures::StreamExt;
use wavemeter_server::driver::SENTINEL_UNDER_EXPOSED;
use wavemeter_server::protocol::Value;

use common::{default_channel, start_server};

#[tokio::test]
async fn connecting_reports_stopped_status() {
    let server = start_server(vec![default_channel("Ch1", 0, 0)]).await;
    let (_client, sta) = server.connect("alice").await;
    assert_eq!(sta.command, "STA");
    assert_eq!(sta.data[0].as_str(), Some("stopped"));
}

#[tokio::test]
async fn subscribing_after_start_delivers_a_measurement() {
    let server = start_server(vec![default_channel("Ch1", 0, 0)]).await;
    let (mut client, _sta) = server.connect("alice").await;

    client
        .send(wavemeter_server::protocol::Frame::control("SRT", vec![]))
        .await
        .unwrap();
    let started = client.next().await.unwrap().unwrap();
    assert_eq!(started.data[0].as_str(), Some("started"));

    client
        .send(wavemeter_server::protocol::Frame::control(
            "UON",
            vec![Value::Str("Ch1".to_string())],
        ))
        .await
        .unwrap();

    let cfr = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let frame = client.next().await.unwrap().unwrap();
            if frame.command == "CFR" {
                return frame;
            }
        }
    })
    .await
    .expect("expected a CFR frame within 3 seconds");

    assert_eq!(cfr.data[0].as_str(), Some("Ch1"));
    assert_eq!(cfr.data[1].as_f64(), Some(300.0));
}

#[tokio::test]
async fn focused_mode_rejects_subscriptions_to_other_channels() {
    let server = start_server(vec![default_channel("Ch1", 0, 0), default_channel("Ch2", 1, 1)]).await;
    let (mut client, _sta) = server.connect("alice").await;

    client
        .send(wavemeter_server::protocol::Frame::control("SRT", vec![]))
        .await
        .unwrap();
    client.next().await.unwrap().unwrap(); // STA started

    client
        .send(wavemeter_server::protocol::Frame::control(
            "FON",
            vec![Value::Str("Ch1".to_string())],
        ))
        .await
        .unwrap();
    client.next().await.unwrap().unwrap(); // FON broadcast

    client
        .send(wavemeter_server::protocol::Frame::control(
            "UON",
            vec![Value::Str("Ch2".to_string())],
        ))
        .await
        .unwrap();
    let nak = client.next().await.unwrap().unwrap();
    assert_eq!(nak.command, "NAK");
}

#[tokio::test]
async fn auto_exposure_raises_exposure_on_underexposed_reading() {
    let server = start_server(vec![default_channel("Ch1", 0, 0)]).await;
    server.wavemeter.force_sentinel(0, Some(SENTINEL_UNDER_EXPOSED));
    let (mut client, _sta) = server.connect("alice").await;

    client
        .send(wavemeter_server::protocol::Frame::control(
            "UON",
            vec![Value::Str("Ch1".to_string())],
        ))
        .await
        .unwrap();
    client
        .send(wavemeter_server::protocol::Frame::control(
            "AEN",
            vec![Value::Str("Ch1".to_string())],
        ))
        .await
        .unwrap();
    client.next().await.unwrap().unwrap(); // AEN ack broadcast

    client
        .send(wavemeter_server::protocol::Frame::control("SRT", vec![]))
        .await
        .unwrap();
    client.next().await.unwrap().unwrap(); // STA started

    let exp = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let frame = client.next().await.unwrap().unwrap();
            if frame.command == "EXP" {
                return frame;
            }
        }
    })
    .await
    .expect("expected an EXP frame within 3 seconds");

    assert_eq!(exp.data[1].as_i64(), Some(15));
}

#[tokio::test]
async fn pid_enabled_channel_eventually_commands_the_dac() {
    let server = start_server(vec![default_channel("Ch1", 0, 3)]).await;
    let (mut client, _sta) = server.connect("alice").await;

    client
        .send(wavemeter_server::protocol::Frame::control(
            "UON",
            vec![Value::Str("Ch1".to_string())],
        ))
        .await
        .unwrap();
    client
        .send(wavemeter_server::protocol::Frame::control(
            "PON",
            vec![Value::Str("Ch1".to_string())],
        ))
        .await
        .unwrap();
    client.next().await.unwrap().unwrap(); // PON ack broadcast

    client
        .send(wavemeter_server::protocol::Frame::control("SRT", vec![]))
        .await
        .unwrap();
    client.next().await.unwrap().unwrap(); // STA started

    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let frame = client.next().await.unwrap().unwrap();
            if frame.command == "APD" {
                break;
            }
        }
    })
    .await
    .expect("expected an APD frame within 3 seconds");

    assert!(server.dac.last_voltage(3).is_some());
}
