use super::*;
use crate::provider::TransportEvent;
use crate::test_support::{FakeProvider, Fakes, RecordingSink, test_options, wait_until};

async fn live_session(text: &str) -> (TranscriptionSession, Arc<FakeProvider>) {
    let provider = Arc::new(FakeProvider::new("fake"));
    let fakes = Fakes::new();
    let mut options = test_options();
    options.commands_enabled = false;
    let session = TranscriptionSession::new(provider.clone(), fakes.context(), options);
    session.start_recording(false).await.unwrap();
    provider.send(TransportEvent::SessionBegins { id: None });
    provider.send(TransportEvent::Final(text.to_string()));
    wait_until(|| session.full_transcript() == text).await;
    (session, provider)
}

#[tokio::test]
async fn test_send_submits_text() {
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = CommandDispatcher::new(sink.clone());
    let (session, _provider) = live_session("ship it").await;
    let id = session.snapshot().session_id.unwrap();

    dispatcher.dispatch(&session, VoiceCommand::Send, "ship it");

    wait_until(|| sink.submitted.lock().unwrap().len() == 1).await;
    assert_eq!(sink.submitted.lock().unwrap()[0], "ship it");
    assert!(sink.inserted.lock().unwrap().is_empty());
    assert_eq!(dispatcher.take_outcome(&id), Some(DispatchOutcome::Submitted));
    assert_eq!(dispatcher.take_outcome(&id), None);
}

#[tokio::test]
async fn test_send_with_empty_text_submits_nothing() {
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = CommandDispatcher::new(sink.clone());
    let (session, _provider) = live_session("x").await;

    dispatcher.dispatch(&session, VoiceCommand::Send, "  ");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert!(sink.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_clear_empties_session() {
    let dispatcher = CommandDispatcher::new(Arc::new(RecordingSink::default()));
    let (session, _provider) = live_session("never mind").await;
    let id = session.snapshot().session_id.unwrap();

    dispatcher.dispatch(&session, VoiceCommand::Clear, "");

    assert_eq!(session.full_transcript(), "");
    assert_eq!(dispatcher.take_outcome(&id), Some(DispatchOutcome::Cleared));
}

#[tokio::test]
async fn test_cancel_abandons_without_submitting() {
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = CommandDispatcher::new(sink.clone());
    let (session, _provider) = live_session("oops").await;
    let id = session.snapshot().session_id.unwrap();

    dispatcher.dispatch(&session, VoiceCommand::Cancel, "oops");

    assert_eq!(session.full_transcript(), "");
    assert_eq!(session.unsaved_transcript(), None);
    assert!(sink.submitted.lock().unwrap().is_empty());
    assert_eq!(dispatcher.take_outcome("other-session"), None);
    assert_eq!(dispatcher.take_outcome(&id), Some(DispatchOutcome::Abandoned));
}
