use super::*;
use crate::provider::TransportEvent;
use crate::test_support::{FakeProvider, Fakes, test_options, wait_until};
use std::sync::atomic::Ordering;

struct Setup {
    engine: Arc<Engine>,
    alpha: Arc<FakeProvider>,
    beta: Arc<FakeProvider>,
    fakes: Fakes,
}

fn setup() -> Setup {
    let alpha = Arc::new(FakeProvider::new("alpha"));
    let beta = Arc::new(FakeProvider::new("beta"));
    let mut registry = ProviderRegistry::new();
    registry.register(alpha.clone()).unwrap();
    registry.register(beta.clone()).unwrap();

    let fakes = Fakes::new();
    let engine = Engine::new(Arc::new(registry), fakes.context(), test_options(), "alpha").unwrap();
    Setup {
        engine: Arc::new(engine),
        alpha,
        beta,
        fakes,
    }
}

/// Start the active session and speak `text` into it.
async fn record(setup: &Setup, provider: &FakeProvider, text: &str) {
    setup.engine.toggle(false).await.unwrap();
    provider.send(TransportEvent::SessionBegins { id: None });
    provider.send(TransportEvent::Final(text.to_string()));
    let session = setup.engine.active();
    let expected = text.to_string();
    wait_until(|| session.full_transcript() == expected).await;
}

#[test]
fn test_unknown_initial_provider() {
    let fakes = Fakes::new();
    let result = Engine::new(
        Arc::new(ProviderRegistry::new()),
        fakes.context(),
        test_options(),
        "missing",
    );

    assert!(matches!(result, Err(SessionError::UnknownProvider(id)) if id == "missing"));
}

#[tokio::test]
async fn test_toggle_starts_then_stops() {
    let s = setup();

    s.engine.toggle(false).await.unwrap();
    assert!(s.engine.active().is_live());
    assert_eq!(s.alpha.connections(), 1);

    s.engine.toggle(false).await.unwrap();
    assert!(!s.engine.active().is_live());
    assert!(s.alpha.last_closed());
}

#[tokio::test]
async fn test_toggle_saves_leftover_text_before_restart() {
    let s = setup();
    record(&s, &s.alpha, "first take").await;
    s.engine.toggle(false).await.unwrap();
    let first_id = s.engine.active().snapshot().session_id;

    s.engine.toggle(false).await.unwrap();

    assert_eq!(s.fakes.hooks.saved(), vec!["first take".to_string()]);
    let snapshot = s.engine.active().snapshot();
    assert_eq!(snapshot.transcript, "");
    assert_ne!(snapshot.session_id, first_id);
}

#[tokio::test]
async fn test_failed_save_aborts_restart() {
    let s = setup();
    record(&s, &s.alpha, "keep me").await;
    s.engine.toggle(false).await.unwrap();
    s.fakes.hooks.fail_save.store(true, Ordering::SeqCst);

    let err = s.engine.toggle(false).await.unwrap_err();

    assert!(matches!(err, SessionError::Persistence(_)));
    assert_eq!(s.alpha.connections(), 1);
    assert_eq!(s.engine.active().full_transcript(), "keep me");
    assert_eq!(s.fakes.hooks.errors().len(), 1);
}

#[tokio::test]
async fn test_select_provider_refused_while_live() {
    let s = setup();
    s.engine.toggle(false).await.unwrap();

    let err = s.engine.select_provider("beta").await.unwrap_err();

    assert_eq!(err, SessionError::ProviderBusy);
    assert_eq!(s.engine.active().provider_id(), "alpha");
}

#[tokio::test]
async fn test_select_unknown_provider() {
    let s = setup();

    let err = s.engine.select_provider("gamma").await.unwrap_err();

    assert_eq!(err, SessionError::UnknownProvider("gamma".into()));
}

#[tokio::test]
async fn test_select_provider_saves_and_swaps() {
    let s = setup();
    record(&s, &s.alpha, "from alpha").await;
    s.engine.toggle(false).await.unwrap();

    s.engine.select_provider("beta").await.unwrap();
    s.engine.toggle(false).await.unwrap();

    assert_eq!(s.engine.active().provider_id(), "beta");
    assert_eq!(s.beta.connections(), 1);
    assert_eq!(s.alpha.connections(), 1);
    assert_eq!(s.fakes.hooks.saved(), vec!["from alpha".to_string()]);
}

#[tokio::test]
async fn test_listener_routes_to_active_session() {
    let s = setup();
    let (trigger, rx) = ToggleTrigger::channel();
    let listener = spawn_toggle_listener(s.engine.clone(), rx);

    s.engine.select_provider("beta").await.unwrap();
    assert!(trigger.fire(false));
    wait_until(|| s.beta.connections() == 1).await;

    assert_eq!(s.alpha.connections(), 0);
    assert!(s.engine.active().is_live());

    drop(trigger);
    listener.await.unwrap();
}

#[tokio::test]
async fn test_reconfigure_reaches_new_sessions() {
    let s = setup();
    let mut options = test_options();
    options.commands_enabled = false;

    s.engine.reconfigure(options);
    s.engine.select_provider("beta").await.unwrap();
    record(&s, &s.beta, "now send it").await;

    assert!(s.fakes.hooks.commands().is_empty());
}

#[tokio::test]
async fn test_clear_saves_then_empties() {
    let s = setup();
    record(&s, &s.alpha, "draft").await;
    s.engine.toggle(false).await.unwrap();

    s.engine.clear_transcript().await.unwrap();

    assert_eq!(s.fakes.hooks.saved(), vec!["draft".to_string()]);
    assert_eq!(s.engine.active().unsaved_transcript(), None);
}

#[tokio::test]
async fn test_shutdown_stops_and_saves() {
    let s = setup();
    record(&s, &s.alpha, "unfinished").await;

    s.engine.shutdown().await;

    assert!(!s.engine.active().is_live());
    assert_eq!(s.fakes.hooks.stopped().len(), 1);
    assert_eq!(s.fakes.hooks.saved(), vec!["unfinished".to_string()]);
}

#[tokio::test]
async fn test_concurrent_toggles_save_leftovers_once() {
    let s = setup();
    record(&s, &s.alpha, "said once").await;
    s.engine.toggle(false).await.unwrap();

    let (first, second) = tokio::join!(s.engine.toggle(false), s.engine.toggle(false));

    first.unwrap();
    second.unwrap();
    assert_eq!(s.fakes.hooks.saved(), vec!["said once".to_string()]);
    // the second toggle found the new session live and stopped it
    assert_eq!(s.alpha.connections(), 2);
    assert!(!s.engine.active().is_live());
}

#[tokio::test]
async fn test_toggle_stops_a_pending_connect() {
    let (gated, gate) = FakeProvider::gated("slow");
    let gated = Arc::new(gated);
    let mut registry = ProviderRegistry::new();
    registry.register(gated.clone()).unwrap();
    let fakes = Fakes::new();
    let engine = Arc::new(
        Engine::new(Arc::new(registry), fakes.context(), test_options(), "slow").unwrap(),
    );

    let starting = tokio::spawn({
        let engine = engine.clone();
        async move { engine.toggle(false).await }
    });
    wait_until(|| engine.active().is_live()).await;

    engine.toggle(false).await.unwrap();
    assert!(!engine.active().is_live());

    gate.notify_one();
    starting.await.unwrap().unwrap();
    assert!(!engine.active().is_live());
    assert!(gated.last_closed());
}

#[tokio::test]
async fn test_select_unavailable_provider_refused() {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(FakeProvider::new("alpha"))).unwrap();
    registry
        .register(Arc::new(FakeProvider::unavailable("offline")))
        .unwrap();
    let fakes = Fakes::new();
    let engine = Engine::new(Arc::new(registry), fakes.context(), test_options(), "alpha").unwrap();

    let err = engine.select_provider("offline").await.unwrap_err();

    assert_eq!(err, SessionError::ProviderUnavailable("offline".into()));
    assert_eq!(engine.active().provider_id(), "alpha");
}
