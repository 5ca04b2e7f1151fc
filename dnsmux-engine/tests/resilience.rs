//! Failure handling: bad upstream frames, connection loss, request aging.

mod helpers;

use std::time::Duration;

use helpers::*;

#[tokio::test]
async fn test_unknown_reply_id_is_ignored() {
    let harness = Harness::start_with_ids(vec![0x0101]).await;
    let client = client().await;

    client
        .send_to(&dns_query(0xABCD, "example.com."), harness.proxy_addr)
        .await
        .unwrap();
    let mut upstream = harness.accept().await;
    let forwarded = read_frame(&mut upstream).await;

    // a well-framed reply for an id nothing is waiting on
    let mut stray = dns_reply_for(&forwarded);
    stray[0..2].copy_from_slice(&0xDEADu16.to_be_bytes());
    write_frame(&mut upstream, &stray).await;
    expect_no_datagram(&client, Duration::from_millis(200)).await;

    // the reader is still armed: the real reply goes through
    write_frame(&mut upstream, &dns_reply_for(&forwarded)).await;
    assert_eq!(wire_id(&recv_udp(&client).await), 0xABCD);
}

#[tokio::test]
async fn test_runt_frame_is_discarded_without_teardown() {
    let harness = Harness::start().await;
    let client = client().await;

    client
        .send_to(&dns_query(0xABCD, "example.com."), harness.proxy_addr)
        .await
        .unwrap();
    let mut upstream = harness.accept().await;
    let forwarded = read_frame(&mut upstream).await;

    // complete frame, but shorter than a DNS header
    write_frame(&mut upstream, &[1, 2, 3, 4, 5]).await;
    expect_no_datagram(&client, Duration::from_millis(200)).await;

    // same connection still serves the pending request
    write_frame(&mut upstream, &dns_reply_for(&forwarded)).await;
    assert_eq!(wire_id(&recv_udp(&client).await), 0xABCD);
}

#[tokio::test]
async fn test_connection_loss_spawns_a_fresh_connection() {
    let harness = Harness::start_with_ids(vec![0x0101, 0x0202]).await;
    let first = client().await;

    first
        .send_to(&dns_query(0xAAAA, "first.example."), harness.proxy_addr)
        .await
        .unwrap();
    let mut conn1 = harness.accept().await;
    let frame1 = read_frame(&mut conn1).await;
    let old_id = wire_id(&frame1);
    assert_eq!(old_id, 0x0101);

    // upstream dies with the request still pending
    drop(conn1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the next query gets a brand-new connection
    let second = client().await;
    second
        .send_to(&dns_query(0xBBBB, "second.example."), harness.proxy_addr)
        .await
        .unwrap();
    let mut conn2 = harness.accept().await;
    let frame2 = read_frame(&mut conn2).await;
    assert_eq!(wire_id(&frame2), 0x0202);

    // requests pending on the dead connection were dropped, not retried
    let mut stale = dns_reply_for(&frame1);
    stale[0..2].copy_from_slice(&old_id.to_be_bytes());
    write_frame(&mut conn2, &stale).await;
    expect_no_datagram(&first, Duration::from_millis(200)).await;

    write_frame(&mut conn2, &dns_reply_for(&frame2)).await;
    assert_eq!(wire_id(&recv_udp(&second).await), 0xBBBB);
}

#[tokio::test]
async fn test_unanswered_request_expires_after_ttl() {
    let harness = Harness::start_with(
        Some(vec![0x0011, 0x0022]),
        Duration::from_millis(200),
    )
    .await;

    let first = client().await;
    first
        .send_to(&dns_query(0xAAAA, "stale.example."), harness.proxy_addr)
        .await
        .unwrap();
    let mut upstream = harness.accept().await;
    let frame1 = read_frame(&mut upstream).await;
    assert_eq!(wire_id(&frame1), 0x0011);

    // no reply; let the request outlive its TTL, then traffic triggers aging
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = client().await;
    second
        .send_to(&dns_query(0xBBBB, "fresh.example."), harness.proxy_addr)
        .await
        .unwrap();
    let frame2 = read_frame(&mut upstream).await;
    assert_eq!(wire_id(&frame2), 0x0022);

    // the expired request is gone: its reply no longer reaches the client
    write_frame(&mut upstream, &dns_reply_for(&frame1)).await;
    expect_no_datagram(&first, Duration::from_millis(200)).await;

    // the fresh request is unaffected
    write_frame(&mut upstream, &dns_reply_for(&frame2)).await;
    assert_eq!(wire_id(&recv_udp(&second).await), 0xBBBB);
}
