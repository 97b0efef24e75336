mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{collect, Harness, ScriptedModel, StallOnceModel, BrokenModel, FRUIT};
use docchat::config::BusyPolicy;
use docchat::conversation::TurnEvent;
use docchat_core::models::{IngestStatus, Role};
use docchat_core::repo::{DocumentRepo, ThreadRepo};
use docchat_core::store::{RecordFilter, VectorStore};
use docchat_core::RagError;
use chrono::Utc;
use futures::StreamExt;

fn roles(thread: &docchat_core::models::Thread) -> Vec<(u32, Role)> {
    thread.messages.iter().map(|m| (m.ordinal, m.role)).collect()
}

#[tokio::test]
async fn answer_from_second_chunk_is_ranked_first_and_turn_persists() {
    let model = Arc::new(ScriptedModel::new(&["Pears ", "ripen ", "indoors."]));
    let h = Harness::new(model.clone());

    let doc = h.upload("fruit.txt", FRUIT).await;
    h.ingestor.attach("t1", &doc.id).await.unwrap();
    assert_eq!(h.ingestor.ingest(&doc.id).await.unwrap(), IngestStatus::Indexed);
    assert_eq!(h.repo.list_chunks(&doc.id).await.unwrap().len(), 3);

    let turn = h.graph.converse("t1", "When do pears ripen?").await.unwrap();
    let out = collect(turn).await;

    assert!(out.error.is_none(), "{:?}", out.error);
    assert_eq!(out.text, "Pears ripen indoors.");
    let sources = out.sources.expect("sources event");
    assert_eq!(sources[0].document_id, doc.id);
    assert_eq!(sources[0].ordinal, 1);

    let prompt = model.last_prompt();
    assert_eq!(prompt.context[0].chunk.ordinal, 1);
    assert!(prompt.system().unwrap().contains("Pears ripen slowly"));

    let thread = h.repo.get_thread("t1").await.unwrap().unwrap();
    assert_eq!(roles(&thread), vec![(0, Role::User), (1, Role::Assistant)]);
    assert_eq!(thread.messages[1].content, "Pears ripen indoors.");
    assert_eq!(out.end.unwrap(), thread.messages[1]);
}

#[tokio::test]
async fn thread_without_documents_skips_retrieval() {
    let model = Arc::new(ScriptedModel::new(&["Hello", " there"]));
    let h = Harness::new(model.clone());

    let out = collect(h.graph.converse("solo", "hi").await.unwrap()).await;
    assert_eq!(out.text, "Hello there");
    assert_eq!(h.embedder.calls(), 0);
    assert_eq!(out.sources, Some(Vec::new()));

    let prompt = model.last_prompt();
    assert!(prompt.context.is_empty());
    assert!(prompt
        .system()
        .unwrap()
        .contains("No relevant documents found for this query."));

    let thread = h.repo.get_thread("solo").await.unwrap().unwrap();
    assert_eq!(roles(&thread), vec![(0, Role::User), (1, Role::Assistant)]);
}

#[tokio::test]
async fn history_is_carried_into_later_prompts() {
    let model = Arc::new(ScriptedModel::new(&["ok"]));
    let h = Harness::new(model.clone());

    collect(h.graph.converse("t", "first question").await.unwrap()).await;
    collect(h.graph.converse("t", "second question").await.unwrap()).await;

    let prompt = model.last_prompt();
    let contents: Vec<&str> = prompt.messages[1..]
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["first question", "ok", "second question"]);
}

#[tokio::test]
async fn exhausted_embedding_retries_fail_document_with_no_records() {
    let h = Harness::new(Arc::new(ScriptedModel::new(&["x"])));
    let doc = h.upload("fruit.txt", FRUIT).await;

    // A good first ingestion, then one that cannot embed.
    h.ingestor.ingest(&doc.id).await.unwrap();
    h.embedder.set_failing(true);
    let err = h.ingestor.ingest(&doc.id).await.unwrap_err();
    assert!(matches!(err, RagError::Index(_)));

    let stored = h.ingestor.document(&doc.id).await.unwrap();
    assert_eq!(stored.status, IngestStatus::Failed);
    let records = h
        .index
        .list(&RecordFilter::Document(doc.id.clone()))
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn cancelled_turn_persists_nothing_and_thread_stays_usable() {
    let model = Arc::new(StallOnceModel::new(ScriptedModel::new(&["second answer"])));
    let h = Harness::new(model.clone());

    let mut turn = h.graph.converse("t1", "first").await.unwrap();
    loop {
        match turn.next().await {
            Some(TurnEvent::Text(t)) => {
                assert_eq!(t, "partial ");
                break;
            }
            Some(TurnEvent::Sources(_)) => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
    turn.cancel();
    let out = collect(turn).await;
    assert_eq!(out.error.unwrap().code, "cancelled");
    assert!(out.end.is_none());

    let out = collect(h.graph.converse("t1", "again").await.unwrap()).await;
    assert_eq!(out.text, "second answer");

    let thread = h.repo.get_thread("t1").await.unwrap().unwrap();
    assert_eq!(
        roles(&thread),
        vec![(0, Role::User), (1, Role::User), (2, Role::Assistant)]
    );
    assert!(thread.messages.iter().all(|m| !m.content.contains("partial")));
}

#[tokio::test]
async fn dropping_the_turn_cancels_it() {
    let model = Arc::new(StallOnceModel::new(ScriptedModel::new(&["later"])));
    let h = Harness::new(model.clone());

    let mut turn = h.graph.converse("t1", "first").await.unwrap();
    while let Some(event) = turn.next().await {
        if matches!(event, TurnEvent::Text(_)) {
            break;
        }
    }
    drop(turn);

    // Queues behind the dropped turn until its task releases the thread.
    let out = collect(h.graph.converse("t1", "second").await.unwrap()).await;
    assert_eq!(out.text, "later");
    let thread = h.repo.get_thread("t1").await.unwrap().unwrap();
    assert_eq!(thread.messages.len(), 3);
}

#[tokio::test]
async fn generation_failure_keeps_user_message_only() {
    let h = Harness::new(Arc::new(BrokenModel));
    let out = collect(h.graph.converse("t1", "question").await.unwrap()).await;

    assert_eq!(out.error.unwrap().code, "generation_error");
    assert!(out.end.is_none());
    let thread = h.repo.get_thread("t1").await.unwrap().unwrap();
    assert_eq!(roles(&thread), vec![(0, Role::User)]);
}

#[tokio::test]
async fn retrieval_failure_degrades_to_no_context() {
    let model = Arc::new(ScriptedModel::new(&["general answer"]));
    let h = Harness::new(model.clone());
    let doc = h.upload("fruit.txt", FRUIT).await;
    h.ingestor.attach("t1", &doc.id).await.unwrap();
    h.ingestor.ingest(&doc.id).await.unwrap();

    h.embedder.set_failing(true);
    let out = collect(h.graph.converse("t1", "pears?").await.unwrap()).await;

    assert_eq!(out.text, "general answer");
    assert!(out.error.is_none());
    assert!(model.last_prompt().context.is_empty());
}

#[tokio::test]
async fn retrieval_never_crosses_thread_scope() {
    let model = Arc::new(ScriptedModel::new(&["ok"]));
    let h = Harness::new(model.clone());

    let mine = h.upload("mine.txt", "Apples are crisp.").await;
    let theirs = h
        .upload("theirs.txt", "Pears pears pears ripen ripen.")
        .await;
    h.ingestor.attach("mine", &mine.id).await.unwrap();
    h.ingestor.attach("theirs", &theirs.id).await.unwrap();
    h.ingestor.ingest_thread("mine").await.unwrap();
    h.ingestor.ingest_thread("theirs").await.unwrap();

    let out = collect(h.graph.converse("mine", "when do pears ripen").await.unwrap()).await;
    let sources = out.sources.unwrap();
    assert!(!sources.is_empty());
    assert!(sources.iter().all(|s| s.document_id == mine.id));
    assert!(model
        .last_prompt()
        .context
        .iter()
        .all(|c| c.chunk.document_id == mine.id));
}

#[tokio::test]
async fn reingestion_leaves_identical_index() {
    let h = Harness::new(Arc::new(ScriptedModel::new(&["x"])));
    let doc = h.upload("fruit.txt", FRUIT).await;
    let filter = RecordFilter::Document(doc.id.clone());

    h.ingestor.ingest(&doc.id).await.unwrap();
    let once = h.index.list(&filter).await.unwrap();
    h.ingestor.ingest(&doc.id).await.unwrap();
    let twice = h.index.list(&filter).await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(h.index.len(), 3);
}

#[tokio::test]
async fn concurrent_turns_on_one_thread_are_serialized() {
    let model = Arc::new(ScriptedModel::with_delay(
        &["a", "b", "c"],
        Duration::from_millis(5),
    ));
    let h = Harness::new(model);

    let (first, second) = tokio::join!(
        async { collect(h.graph.converse("t1", "one").await.unwrap()).await },
        async { collect(h.graph.converse("t1", "two").await.unwrap()).await },
    );
    assert!(first.end.is_some() && second.end.is_some());

    let thread = h.repo.get_thread("t1").await.unwrap().unwrap();
    assert_eq!(
        roles(&thread),
        vec![
            (0, Role::User),
            (1, Role::Assistant),
            (2, Role::User),
            (3, Role::Assistant)
        ]
    );
}

#[tokio::test]
async fn reject_policy_refuses_second_turn() {
    let model = Arc::new(StallOnceModel::new(ScriptedModel::new(&["x"])));
    let h = Harness::with_policy(model, BusyPolicy::Reject);

    let turn = h.graph.converse("t1", "one").await.unwrap();
    let err = h.graph.converse("t1", "two").await.err().unwrap();
    assert!(matches!(err, RagError::TurnInProgress(_)));

    // Other threads are unaffected.
    assert!(h.graph.converse("t2", "hello").await.is_ok());
    drop(turn);
}

#[tokio::test]
async fn processing_document_refuses_second_ingestion() {
    let h = Harness::new(Arc::new(ScriptedModel::new(&["x"])));
    let doc = h.upload("fruit.txt", FRUIT).await;
    assert!(h.repo.try_begin_ingest(&doc.id, Utc::now()).await.unwrap());

    let err = h.ingestor.ingest(&doc.id).await.unwrap_err();
    assert!(matches!(err, RagError::IngestInProgress(_)));
    assert_eq!(
        h.ingestor.document(&doc.id).await.unwrap().status,
        IngestStatus::Processing
    );
}

#[tokio::test]
async fn abandoned_ingestion_does_not_strand_document() {
    let h = Harness::new(Arc::new(ScriptedModel::new(&["x"])));
    let doc = h.upload("fruit.txt", FRUIT).await;

    // The caller gives up almost immediately while the embedder is down.
    h.embedder.set_failing(true);
    let _ = tokio::time::timeout(Duration::from_micros(1), h.ingestor.ingest(&doc.id)).await;

    let settled = async {
        loop {
            let status = h.ingestor.document(&doc.id).await.unwrap().status;
            if status != IngestStatus::Processing {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    let status = tokio::time::timeout(Duration::from_secs(10), settled)
        .await
        .expect("ingestion never settled");
    assert_eq!(status, IngestStatus::Failed);

    h.embedder.set_failing(false);
    assert_eq!(h.ingestor.ingest(&doc.id).await.unwrap(), IngestStatus::Indexed);
}

#[tokio::test]
async fn failed_reextraction_removes_document_from_answers() {
    let model = Arc::new(ScriptedModel::new(&["ok"]));
    let h = Harness::new(model.clone());
    let doc = h.upload("fruit.txt", FRUIT).await;
    h.ingestor.attach("t1", &doc.id).await.unwrap();
    h.ingestor.ingest(&doc.id).await.unwrap();

    // A blank re-upload under the same key.
    h.source.put("fruit.txt", b"   ");
    let err = h.ingestor.ingest(&doc.id).await.unwrap_err();
    assert!(matches!(err, RagError::Extraction(_)));

    assert_eq!(
        h.ingestor.document(&doc.id).await.unwrap().status,
        IngestStatus::Failed
    );
    assert!(h
        .index
        .list(&RecordFilter::Document(doc.id.clone()))
        .await
        .unwrap()
        .is_empty());
    assert!(h.repo.list_chunks(&doc.id).await.unwrap().is_empty());

    let out = collect(h.graph.converse("t1", "when do pears ripen").await.unwrap()).await;
    assert_eq!(out.sources, Some(Vec::new()));
    assert!(model.last_prompt().context.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reject_policy_accepts_turn_right_after_end() {
    let h = Harness::with_policy(Arc::new(ScriptedModel::new(&["ok"])), BusyPolicy::Reject);

    for i in 0..50 {
        let turn = h
            .graph
            .converse("t1", &format!("question {}", i))
            .await
            .unwrap_or_else(|e| panic!("turn {} refused: {}", i, e));
        let out = collect(turn).await;
        assert!(out.end.is_some(), "turn {} did not end: {:?}", i, out.error);
    }

    let thread = h.repo.get_thread("t1").await.unwrap().unwrap();
    assert_eq!(thread.messages.len(), 100);
}

#[tokio::test]
async fn oversized_question_still_reaches_the_model() {
    let model = Arc::new(ScriptedModel::new(&["ok"]));
    let h = Harness::new(model.clone());
    collect(h.graph.converse("t1", "earlier question").await.unwrap()).await;

    let question = "pears ".repeat(2_000);
    let out = collect(h.graph.converse("t1", &question).await.unwrap()).await;
    assert!(out.end.is_some());

    let prompt = model.last_prompt();
    let last = prompt.messages.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(last.content, question);
    assert!(prompt.messages.iter().all(|m| m.content != "earlier question"));
}
