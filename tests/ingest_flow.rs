//! End-to-end ingestion flow over a real (in-memory) store.

use std::sync::Arc;

use inboxd::store::{LibSqlBackend, MessageStore, Role};
use inboxd::threading::{InboundEmail, IngestionPipeline};

async fn setup() -> (IngestionPipeline, Arc<dyn MessageStore>) {
    let store: Arc<dyn MessageStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    (IngestionPipeline::new(Arc::clone(&store), 500), store)
}

fn user_mail(sender: &str, message_id: &str, in_reply_to: Option<&str>, subject: &str) -> InboundEmail {
    InboundEmail {
        sender_email: sender.to_string(),
        message_id: message_id.to_string(),
        in_reply_to: in_reply_to.map(str::to_string),
        subject: subject.to_string(),
        body: "body".to_string(),
        role: Role::User,
    }
}

#[tokio::test]
async fn conversation_lifecycle() {
    let (pipeline, store) = setup().await;

    // Customer opens a conversation.
    let s1 = pipeline
        .ingest(user_mail("Alice <alice@x.com>", "M1", None, "Order issue"))
        .await
        .unwrap();
    assert_eq!(s1, "M1");

    // Our reply threads under it.
    let s2 = pipeline
        .ingest(InboundEmail {
            sender_email: "bot@x.com".to_string(),
            message_id: "R1".to_string(),
            in_reply_to: Some("M1".to_string()),
            subject: "Re: Order issue".to_string(),
            body: "we are on it".to_string(),
            role: Role::Host,
        })
        .await
        .unwrap();
    assert_eq!(s2, "M1");

    // Customer replies to our reply.
    let s3 = pipeline
        .ingest(user_mail("alice@x.com", "M2", Some("R1"), "Re: Order issue"))
        .await
        .unwrap();
    assert_eq!(s3, "M1");

    // Every message sits in one session.
    let all = store.list_all().await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|e| e.session_id == "M1"));
}

#[tokio::test]
async fn redelivered_batch_changes_nothing() {
    let (pipeline, store) = setup().await;

    let batch = [
        user_mail("a@x.com", "M1", None, "Hello"),
        user_mail("b@y.com", "M2", None, "Question"),
    ];

    for mail in &batch {
        pipeline.ingest(mail.clone()).await.unwrap();
    }
    let before = store.list_all().await.unwrap().len();

    // Simulated IMAP re-sync: the same physical emails arrive again.
    for mail in &batch {
        pipeline.ingest(mail.clone()).await.unwrap();
    }

    assert_eq!(store.list_all().await.unwrap().len(), before);
}

#[tokio::test]
async fn split_thread_reconverges() {
    let (pipeline, store) = setup().await;

    // A client stripped the reply headers, so the follow-up seeds its own
    // session at first.
    pipeline
        .ingest(user_mail("carol@x.com", "M1", None, "Broken login"))
        .await
        .unwrap();
    let s2 = pipeline
        .ingest(user_mail("Carol <carol@X.com>", "M2", None, "Anything yet?"))
        .await
        .unwrap();
    assert_eq!(s2, "M2");

    // Retroactive merge pulled M1 into M2's session.
    let m1 = store.find_by_message_id("M1").await.unwrap().unwrap();
    assert_eq!(m1.session_id, "M2");

    // A later reply through the normal header chain stays in the merged
    // session.
    let s3 = pipeline
        .ingest(user_mail("carol@x.com", "M3", Some("M2"), "Re: Anything yet?"))
        .await
        .unwrap();
    assert_eq!(s3, "M2");
}

#[tokio::test]
async fn listing_is_a_pure_projection() {
    let (pipeline, store) = setup().await;

    pipeline
        .ingest(user_mail("a@x.com", "M1", None, "One"))
        .await
        .unwrap();
    pipeline
        .ingest(user_mail("a@x.com", "M2", None, "Two"))
        .await
        .unwrap();

    let all = store.list_all().await.unwrap();
    assert_eq!(all.len(), 2);
    // Newest first.
    assert_eq!(all[0].message_id, "M2");
    // Raw sender preserved at rest; normalization happens on demand.
    assert_eq!(all[1].sender_email, "a@x.com");
}
