mod common;

use agent_commerce::client::{FetchOptions, PaymentClient, PaymentSigner};
use agent_commerce::models::{PaymentChallenge, PolicyRule, CHALLENGE_HEADER, PROOF_HEADER};
use agent_commerce::CommerceError;
use common::*;
use ethers::types::{Address, U256};
use mockito::{Matcher, Mock, ServerGuard};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

fn seller() -> Address {
    Address::repeat_byte(0x5e)
}

fn challenge(amount: &str, recipient: Address) -> String {
    PaymentChallenge {
        amount: d(amount),
        currency: "USDC".to_string(),
        recipient,
        network: "base-sepolia".to_string(),
        description: Some("premium forecast".to_string()),
        facilitator_url: None,
    }
    .to_header()
    .unwrap()
}

/// A paywalled path: 402 without proof, 200 with it.
async fn paywall(server: &mut ServerGuard, path: &str, amount: &str, recipient: Address) -> (Mock, Mock) {
    let unpaid = server
        .mock("GET", path)
        .match_header(PROOF_HEADER, Matcher::Missing)
        .with_status(402)
        .with_header(CHALLENGE_HEADER, &challenge(amount, recipient))
        .create_async()
        .await;
    let paid = server
        .mock("GET", path)
        .match_header(PROOF_HEADER, Matcher::Regex(".+".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"forecast":"sunny"}"#)
        .create_async()
        .await;
    (unpaid, paid)
}

#[tokio::test]
async fn test_free_resource_passes_through() {
    let h = harness(policy("1", "10", "0.1"), "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let _free = server
        .mock("GET", "/free")
        .with_status(200)
        .with_body("hello")
        .create_async()
        .await;

    let client = PaymentClient::new(h.ctx.clone());
    let outcome = client
        .fetch(&format!("{}/free", server.url()), FetchOptions::default(), "test")
        .await
        .unwrap();

    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, "hello");
    assert!(outcome.payment.is_none());
    assert!(h.signer.transfers().is_empty());
}

#[tokio::test]
async fn test_pays_challenge_and_retries_with_proof() {
    let h = harness(policy("1", "10", "0.1"), "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let (unpaid, paid) = paywall(&mut server, "/forecast", "0.30", seller()).await;

    let client = PaymentClient::new(h.ctx.clone());
    let outcome = client
        .fetch(&format!("{}/forecast", server.url()), FetchOptions::default(), "weather")
        .await
        .unwrap();

    unpaid.assert_async().await;
    paid.assert_async().await;
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.body, r#"{"forecast":"sunny"}"#);
    assert!(!outcome.cancelled_after_payment);

    let receipt = outcome.payment.unwrap();
    assert_eq!(receipt.amount, d("0.30"));
    assert_eq!(receipt.recipient, seller());
    assert_eq!(receipt.payer, h.signer.address());
    assert_eq!(h.signer.transfers(), vec![(seller(), U256::from(300_000u64))]);
    assert_eq!(h.approver.calls(), 1);

    let spending = h.ctx.policy.daily_spending().await;
    assert_eq!(spending.total, d("0.30"));
    let log = h.ctx.ledger.transaction_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].tx_hash, receipt.tx_hash);
}

#[tokio::test]
async fn test_approval_thresholds_over_a_session() {
    let h = harness(policy("1.00", "10.00", "0.10"), "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let _big = paywall(&mut server, "/big", "0.30", seller()).await;
    let _small = paywall(&mut server, "/small", "0.05", seller()).await;
    let client = PaymentClient::new(h.ctx.clone());

    for i in 1..=3 {
        client
            .fetch(&format!("{}/big", server.url()), FetchOptions::default(), "big")
            .await
            .unwrap();
        assert_eq!(h.approver.calls(), i);
    }

    client
        .fetch(&format!("{}/small", server.url()), FetchOptions::default(), "small")
        .await
        .unwrap();
    assert_eq!(h.approver.calls(), 3);
    assert_eq!(h.ctx.policy.daily_spending().await.total, d("0.95"));
}

#[tokio::test]
async fn test_hard_ceiling_stops_before_policy() {
    let h = harness(policy("10", "100", "10"), "100", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let _expensive = paywall(&mut server, "/expensive", "6.00", seller()).await;

    let err = PaymentClient::new(h.ctx.clone())
        .fetch(&format!("{}/expensive", server.url()), FetchOptions::default(), "x")
        .await
        .unwrap_err();

    assert!(matches!(err, CommerceError::CeilingExceeded { .. }));
    assert!(h.signer.transfers().is_empty());
}

#[tokio::test]
async fn test_blacklisted_seller_is_refused() {
    let mut p = policy("1", "10", "0.1");
    p.blacklisted_recipients.insert(seller());
    let h = harness(p, "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let _paywall = paywall(&mut server, "/x", "0.01", seller()).await;

    let err = PaymentClient::new(h.ctx.clone())
        .fetch(&format!("{}/x", server.url()), FetchOptions::default(), "x")
        .await
        .unwrap_err();

    match err {
        CommerceError::PolicyDenied { reason, .. } => assert!(reason.contains("blacklisted")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.approver.calls(), 0);
    assert!(h.signer.transfers().is_empty());

    let decision = h.ctx.policy.check_payment(seller(), d("0.01")).await;
    assert_eq!(decision.rule, PolicyRule::Blacklisted);
}

#[tokio::test]
async fn test_approval_outcomes_are_distinct() {
    let mut server = mockito::Server::new_async().await;
    let _paywall = paywall(&mut server, "/x", "0.50", seller()).await;
    let url = format!("{}/x", server.url());

    let denied = harness(policy("1", "10", "0.1"), "10", Approver::no()).await;
    let err = PaymentClient::new(denied.ctx.clone())
        .fetch(&url, FetchOptions::default(), "x")
        .await
        .unwrap_err();
    assert!(matches!(err, CommerceError::ApprovalDenied { .. }));

    let silent = harness(policy("1", "10", "0.1"), "10", Approver::silent()).await;
    let err = PaymentClient::new(silent.ctx.clone())
        .fetch(&url, FetchOptions::default(), "x")
        .await
        .unwrap_err();
    assert!(matches!(err, CommerceError::ApprovalTimeout { .. }));
    assert!(err.is_retryable_with_new_request());

    let cancelled = harness(policy("1", "10", "0.1"), "10", Approver::silent()).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        trigger.cancel();
    });
    let err = PaymentClient::new(cancelled.ctx.clone())
        .fetch_with_cancel(&url, FetchOptions::default(), "x", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CommerceError::ApprovalCancelled { .. }));

    for h in [&denied, &silent, &cancelled] {
        assert!(h.signer.transfers().is_empty());
        assert_eq!(h.ctx.policy.daily_spending().await.count, 0);
    }
}

#[tokio::test]
async fn test_insufficient_balance_moves_nothing() {
    let h = harness(policy("1", "10", "1"), "0.20", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let _paywall = paywall(&mut server, "/x", "0.30", seller()).await;

    let err = PaymentClient::new(h.ctx.clone())
        .fetch(&format!("{}/x", server.url()), FetchOptions::default(), "x")
        .await
        .unwrap_err();

    match err {
        CommerceError::InsufficientBalance {
            required,
            available,
        } => {
            assert_eq!(required, d("0.30"));
            assert_eq!(available, d("0.2"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.ctx.ledger.transaction_log().await.is_empty());
}

#[tokio::test]
async fn test_second_challenge_keeps_the_payment_on_record() {
    let h = harness(policy("1", "10", "1"), "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let _stubborn = server
        .mock("GET", "/stubborn")
        .with_status(402)
        .with_header(CHALLENGE_HEADER, &challenge("0.10", seller()))
        .expect(2)
        .create_async()
        .await;

    let err = PaymentClient::new(h.ctx.clone())
        .fetch(&format!("{}/stubborn", server.url()), FetchOptions::default(), "x")
        .await
        .unwrap_err();

    let tx_hash = match err {
        CommerceError::UnexpectedChallenge { tx_hash } => tx_hash,
        other => panic!("unexpected {:?}", other),
    };
    let log = h.ctx.ledger.transaction_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].tx_hash, tx_hash);
    assert_eq!(h.signer.transfers().len(), 1);
}

#[tokio::test]
async fn test_402_without_challenge_is_a_protocol_error() {
    let h = harness(policy("1", "10", "1"), "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let _bare = server
        .mock("GET", "/bare")
        .with_status(402)
        .create_async()
        .await;
    let _garbled = server
        .mock("GET", "/garbled")
        .with_status(402)
        .with_header(CHALLENGE_HEADER, "%%%not-base64%%%")
        .create_async()
        .await;

    let client = PaymentClient::new(h.ctx.clone());
    let err = client
        .fetch(&format!("{}/bare", server.url()), FetchOptions::default(), "x")
        .await
        .unwrap_err();
    assert!(matches!(err, CommerceError::MissingChallenge));
    assert!(!err.is_retryable_with_new_request());

    let err = client
        .fetch(&format!("{}/garbled", server.url()), FetchOptions::default(), "x")
        .await
        .unwrap_err();
    assert!(matches!(err, CommerceError::MalformedChallenge(_)));
}

#[tokio::test]
async fn test_wrong_network_is_rejected() {
    let h = harness(policy("1", "10", "1"), "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let header = PaymentChallenge {
        amount: d("0.01"),
        currency: "USDC".to_string(),
        recipient: seller(),
        network: "ethereum".to_string(),
        description: None,
        facilitator_url: None,
    }
    .to_header()
    .unwrap();
    let _mainnet = server
        .mock("GET", "/mainnet")
        .with_status(402)
        .with_header(CHALLENGE_HEADER, &header)
        .create_async()
        .await;

    let err = PaymentClient::new(h.ctx.clone())
        .fetch(&format!("{}/mainnet", server.url()), FetchOptions::default(), "x")
        .await
        .unwrap_err();
    assert!(matches!(err, CommerceError::MalformedChallenge(_)));
    assert!(h.signer.transfers().is_empty());
}

#[tokio::test]
async fn test_concurrent_fetches_share_the_daily_limit() {
    // Each payment fits alone; both together would break the daily limit.
    let h = harness(policy("1", "0.50", "1"), "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let _a = paywall(&mut server, "/a", "0.30", seller()).await;
    let _b = paywall(&mut server, "/b", "0.30", seller()).await;

    let client = Arc::new(PaymentClient::new(h.ctx.clone()));
    let url_a = format!("{}/a", server.url());
    let url_b = format!("{}/b", server.url());
    let (a, b) = tokio::join!(
        client.fetch(&url_a, FetchOptions::default(), "a"),
        client.fetch(&url_b, FetchOptions::default(), "b"),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(CommerceError::PolicyDenied { .. }))));
    assert_eq!(h.signer.transfers().len(), 1);
    assert_eq!(h.ctx.policy.daily_spending().await.total, d("0.30"));
}

#[tokio::test]
async fn test_unpayable_precision_rejected_before_approval() {
    let h = harness(policy("1", "10", "0"), "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let _dust = paywall(&mut server, "/dust", "0.0000001", seller()).await;

    let err = PaymentClient::new(h.ctx.clone())
        .fetch(&format!("{}/dust", server.url()), FetchOptions::default(), "x")
        .await
        .unwrap_err();

    assert!(matches!(err, CommerceError::MalformedChallenge(_)));
    assert_eq!(h.approver.calls(), 0);
    assert!(h.signer.transfers().is_empty());
}

#[tokio::test]
async fn test_cancel_during_broadcast_completes_delivery() {
    let h = harness(policy("1", "10", "1"), "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let (_unpaid, paid) = paywall(&mut server, "/forecast", "0.20", seller()).await;
    let cancel = CancellationToken::new();
    h.signer.cancel_on_transfer(cancel.clone());

    let outcome = PaymentClient::new(h.ctx.clone())
        .fetch_with_cancel(
            &format!("{}/forecast", server.url()),
            FetchOptions::default(),
            "weather",
            &cancel,
        )
        .await
        .unwrap();

    paid.assert_async().await;
    assert!(cancel.is_cancelled());
    assert!(outcome.cancelled_after_payment);
    assert_eq!(outcome.status, 200);
    let receipt = outcome.payment.unwrap();
    let log = h.ctx.ledger.transaction_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].tx_hash, receipt.tx_hash);
}

/// Answers one request with a 402 and closes the port before the paid retry.
async fn one_shot_paywall(amount: &str) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let response = format!(
        "HTTP/1.1 402 Payment Required\r\n{}: {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        CHALLENGE_HEADER,
        challenge(amount, seller())
    );
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        drop(listener);
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
    });
    format!("http://{}/report", addr)
}

#[tokio::test]
async fn test_retry_transport_failure_keeps_payment_fact() {
    let h = harness(policy("1", "10", "1"), "10", Approver::yes()).await;
    let url = one_shot_paywall("0.10").await;

    let err = PaymentClient::new(h.ctx.clone())
        .fetch(&url, FetchOptions::default(), "report")
        .await
        .unwrap_err();

    let tx_hash = match err {
        CommerceError::PaidButUndelivered { tx_hash, amount, .. } => {
            assert_eq!(amount, d("0.10"));
            tx_hash
        }
        other => panic!("unexpected {:?}", other),
    };
    assert!(!CommerceError::PaidButUndelivered {
        tx_hash,
        amount: d("0.10"),
        reason: String::new(),
    }
    .is_retryable_with_new_request());
    assert_eq!(h.signer.transfers().len(), 1);
    let log = h.ctx.ledger.transaction_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].tx_hash, tx_hash);
}

#[tokio::test]
async fn test_ledger_write_failure_does_not_fail_the_fetch() {
    let h = harness(policy("1", "10", "1"), "10", Approver::yes()).await;
    let mut server = mockito::Server::new_async().await;
    let (_unpaid, paid) = paywall(&mut server, "/forecast", "0.10", seller()).await;
    // A directory where the log's temp file goes makes every log write fail.
    std::fs::create_dir(h.dir.path().join(format!(
        "{}.tmp",
        agent_commerce::services::ledger::TRANSACTION_LOG_FILE
    )))
    .unwrap();

    let outcome = PaymentClient::new(h.ctx.clone())
        .fetch(&format!("{}/forecast", server.url()), FetchOptions::default(), "weather")
        .await
        .unwrap();

    paid.assert_async().await;
    assert_eq!(outcome.status, 200);
    assert!(outcome.payment.is_some());
    assert_eq!(h.signer.transfers().len(), 1);
    assert!(h.ctx.ledger.transaction_log().await.is_empty());
}
