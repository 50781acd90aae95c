//! End-to-end scenario tests (S1-S6).
//!
//! S1, S4, S5 drive the real `ClaudeRunner`/`SessionBroker` code paths
//! against an in-process fake child process: a tiny shell script named
//! `claude` is placed on `PATH` ahead of the real binary for the duration
//! of the test, so `Command::new("claude")` picks it up without any
//! production seam being added just for tests. `PATH` is a process-wide
//! resource, so every test that touches it serializes on `path_lock()`.
//!
//! S2, S3, S6 exercise `ToolExecutor`/`ShimTranslator` directly - those
//! scenarios never involve spawning a provider CLI at all in this crate's
//! own architecture (Claude passthrough executes tools upstream; only the
//! shim path runs them here), so a fake child process isn't the right unit
//! for them.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use agentbrokerd::config::DaemonConfig;
use agentbrokerd::process::ProcessRegistry;
use agentbrokerd::session::claude::ClaudeRunner;
use agentbrokerd::session::runner::Runner;
use agentbrokerd::session::SessionBroker;
use agentbrokerd::stream::{CanonicalEvent, SystemSubtype};
use agentbrokerd::tools::sandbox::SandboxPolicy;
use agentbrokerd::tools::ToolExecutor;
use agentbrokerd::approval::ApprovalRouter;

fn path_lock() -> &'static tokio::sync::Mutex<()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
}

/// Write an executable shell script named `claude` into `dir` and prepend
/// `dir` to `PATH` for the lifetime of the returned guard.
struct FakeClaudeOnPath {
    original_path: String,
}

impl FakeClaudeOnPath {
    fn install(dir: &Path, script_body: &str) -> Self {
        let script_path = dir.join("claude");
        let mut f = std::fs::File::create(&script_path).expect("create fake claude script");
        writeln!(f, "#!/bin/sh").unwrap();
        write!(f, "{script_body}").unwrap();
        drop(f);
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let original_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", dir.display(), original_path));
        Self { original_path }
    }
}

impl Drop for FakeClaudeOnPath {
    fn drop(&mut self) {
        std::env::set_var("PATH", &self.original_path);
    }
}

fn test_config() -> DaemonConfig {
    DaemonConfig {
        bind_addr: "127.0.0.1:0".into(),
        max_line_bytes: 100 * 1024,
        kill_grace: Duration::from_millis(100),
        bash_timeout: Duration::from_secs(5),
        max_concurrent_sessions: 8,
        tool_output_cap_bytes: 64 * 1024,
        default_permission_mode: "auto".into(),
        auth_token: "test".into(),
        log_format_json: false,
        log_file: None,
    }
}

fn test_broker() -> std::sync::Arc<SessionBroker> {
    let registry = std::sync::Arc::new(ProcessRegistry::new(8, Duration::from_millis(100)));
    let executor = std::sync::Arc::new(ToolExecutor::new(SandboxPolicy::new("/tmp", vec![]), 64 * 1024, Duration::from_secs(5)));
    let approvals = std::sync::Arc::new(ApprovalRouter::new());
    std::sync::Arc::new(SessionBroker::new(registry, executor, approvals, std::sync::Arc::new(test_config())))
}

// S1 - Happy path text.
#[tokio::test]
async fn s1_happy_path_text() {
    let _guard = path_lock().lock().await;
    let bin_dir = tempfile::tempdir().unwrap();
    let _fake = FakeClaudeOnPath::install(
        bin_dir.path(),
        r#"cat <<'EOF'
{"type":"system","subtype":"init","session_id":"p-1","model":"M","cwd":"/w","permission_mode":"default","tools":["Read","Bash"]}
{"type":"text","content":"hi"}
{"type":"usage","input_tokens":10,"output_tokens":1}
{"type":"result","is_error":false}
EOF
"#,
    );

    let cwd_dir = tempfile::tempdir().unwrap();
    let registry = std::sync::Arc::new(ProcessRegistry::new(4, Duration::from_millis(100)));
    let runner = ClaudeRunner::new(
        "s1".to_string(),
        cwd_dir.path().to_string_lossy().to_string(),
        "M".to_string(),
        "default".to_string(),
        100 * 1024,
        registry,
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel(32);
    runner.run_turn("echo hi", tx).await.expect("run_turn");

    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }

    assert!(matches!(&events[0], CanonicalEvent::System { subtype: SystemSubtype::Init, session_id: Some(s), .. } if s == "p-1"));
    assert!(matches!(&events[1], CanonicalEvent::Text { content, .. } if content == "hi"));
    assert!(matches!(&events[2], CanonicalEvent::Usage(u) if u.input_tokens == 10 && u.output_tokens == 1));
    assert!(matches!(&events[3], CanonicalEvent::Result(r) if !r.is_error));
    assert!(matches!(&events[4], CanonicalEvent::MessageStop));
    assert_eq!(events.len(), 5, "exactly the four canonical events plus message_stop");
    assert_eq!(runner.provider_session_id().await, Some("p-1".to_string()));
}

// S2 - Single edit, driven through ToolExecutor directly (the component
// that actually performs the rewrite in this architecture).
#[tokio::test]
async fn s2_single_edit() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "foo bar").unwrap();
    let executor = ToolExecutor::new(SandboxPolicy::new(dir.path(), vec![]), 64 * 1024, Duration::from_secs(5));

    let input = serde_json::json!({
        "file_path": dir.path().join("a.txt").to_string_lossy(),
        "old_string": "foo",
        "new_string": "bar",
    });
    let outcome = executor.run("Edit", &input).await;
    assert!(!outcome.is_error, "edit should succeed: {}", outcome.content);

    let rewritten = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
    assert_eq!(rewritten, "bar bar");
}

// S3 - Partial JSON coalescing across three upstream chunks.
#[tokio::test]
async fn s3_partial_json_coalescing() {
    use agentbrokerd::session::shim::translate::{AlienEvent, ShimTranslator};

    let mut translator = ShimTranslator::new("gemini");
    let chunks = ["{\"file_path\":\"/w/", "a.txt\",\"old_string\":\"x\",\"new_string", ":\"y\"}"];

    let mut tool_uses = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let name = if i == 0 { Some("Edit".to_string()) } else { None };
        let out = translator.translate(AlienEvent::FunctionCallDelta { call_index: 0, name, args_chunk: chunk.to_string() });
        tool_uses.extend(out.into_iter().filter(|e| matches!(e, CanonicalEvent::ToolUse { .. })));
    }

    assert_eq!(tool_uses.len(), 1, "exactly one tool_use regardless of chunk count");
    if let CanonicalEvent::ToolUse { input, .. } = &tool_uses[0] {
        assert_eq!(input["file_path"], "/w/a.txt");
        assert_eq!(input["old_string"], "x");
        assert_eq!(input["new_string"], "y");
    } else {
        unreachable!();
    }
}

// S4 - Interrupt before response: deferred, then fired on first content block.
#[tokio::test]
async fn s4_interrupt_before_response() {
    let _guard = path_lock().lock().await;
    let bin_dir = tempfile::tempdir().unwrap();
    let _fake = FakeClaudeOnPath::install(
        bin_dir.path(),
        r#"sleep 0.3
echo '{"type":"text","content":"hello"}'
exec sleep 5
"#,
    );

    let cwd_dir = tempfile::tempdir().unwrap();
    let broker = test_broker();
    let mut rx = broker.subscribe("s4", "claude", "M", &cwd_dir.path().to_string_lossy()).await;

    broker.submit_turn("s4", "claude", "M", &cwd_dir.path().to_string_lossy(), "hello").await.expect("submit_turn");

    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.interrupt("s4").await;

    let mut saw_text = false;
    let mut saw_interrupted = false;
    let mut saw_error_result = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Ok(CanonicalEvent::Text { .. })) => saw_text = true,
            Ok(Ok(CanonicalEvent::System { subtype: SystemSubtype::Interrupted, .. })) => saw_interrupted = true,
            Ok(Ok(CanonicalEvent::Result(r))) => {
                saw_error_result = r.is_error;
                break;
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }

    assert!(saw_text, "the child's first content block must have been observed");
    assert!(saw_interrupted, "a deferred interrupt firing on the first content block must surface system/interrupted");
    assert!(saw_error_result, "an interrupted turn resolves to an error result");
}

// S5 - Resume failure clears providerSessionId; the next turn starts fresh.
//
// Drives three real turns through the same session: the first establishes
// a `providerSessionId` via `system(init)`, the second is resumed against
// it and fails (the fake script rejects any invocation carrying
// `--resume`), the third must therefore be a fresh invocation (no
// `--resume` in argv) rather than retrying the dead provider session.
#[tokio::test]
async fn s5_resume_failure_then_fresh_session() {
    let _guard = path_lock().lock().await;
    let bin_dir = tempfile::tempdir().unwrap();
    let _fake = FakeClaudeOnPath::install(
        bin_dir.path(),
        r#"COUNTER_FILE="$(dirname "$0")/counter"
[ -f "$COUNTER_FILE" ] || echo 0 > "$COUNTER_FILE"
N=$(($(cat "$COUNTER_FILE") + 1))
echo "$N" > "$COUNTER_FILE"

for a in "$@"; do
  if [ "$a" = "--resume" ]; then
    echo "No conversation found with session ID" 1>&2
    exit 1
  fi
done

if [ "$N" = "1" ]; then
  cat <<'EOF'
{"type":"system","subtype":"init","session_id":"p-old","model":"M","cwd":"/w","permission_mode":"default","tools":[]}
{"type":"text","content":"first reply"}
{"type":"usage","input_tokens":1,"output_tokens":1}
{"type":"result","is_error":false}
EOF
else
  cat <<'EOF'
{"type":"system","subtype":"init","session_id":"p-new","model":"M","cwd":"/w","permission_mode":"default","tools":[]}
{"type":"text","content":"fresh reply"}
{"type":"usage","input_tokens":1,"output_tokens":1}
{"type":"result","is_error":false}
EOF
fi
"#,
    );

    let cwd_dir = tempfile::tempdir().unwrap();
    let cwd = cwd_dir.path().to_string_lossy().to_string();
    let broker = test_broker();
    let mut rx = broker.subscribe("s5", "claude", "M", &cwd).await;

    // Turn 1: establishes providerSessionId = "p-old".
    broker.submit_turn("s5", "claude", "M", &cwd, "hello").await.expect("submit_turn 1");
    let mut saw_old_session = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(CanonicalEvent::System { session_id: Some(s), .. })) if s == "p-old" => saw_old_session = true,
            Ok(Ok(CanonicalEvent::Result(_))) => break,
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_old_session, "turn 1 must report providerSessionId p-old");

    // Turn 2: resumed against p-old, fails.
    broker.submit_turn("s5", "claude", "M", &cwd, "resume please").await.expect("submit_turn 2");
    let mut saw_text = false;
    let mut saw_restore_result = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(CanonicalEvent::Text { .. })) => saw_text = true,
            Ok(Ok(CanonicalEvent::Result(r))) => {
                saw_restore_result = r.is_error && r.requires_checkpoint_restore;
                break;
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(!saw_text, "a resume failure must not emit any text events");
    assert!(saw_restore_result, "a resume failure resolves to an error result requiring checkpoint restore");

    // Turn 3: starts fresh (no --resume passed, since providerSessionId
    // was cleared), and succeeds against a brand new provider session.
    broker.submit_turn("s5", "claude", "M", &cwd, "resume please").await.expect("submit_turn 3");
    let mut saw_fresh_text = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(CanonicalEvent::Text { content, .. })) if content == "fresh reply" => {
                saw_fresh_text = true;
                break;
            }
            Ok(Ok(CanonicalEvent::Result(_))) => break,
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_fresh_text, "the retried turn must succeed against a fresh session, not --resume the dead one");
}

// S6 - Path-sandbox violation: rejected before any filesystem read.
#[tokio::test]
async fn s6_path_sandbox_violation() {
    let cwd = tempfile::tempdir().unwrap();
    let executor = ToolExecutor::new(SandboxPolicy::new(cwd.path(), vec![]), 64 * 1024, Duration::from_secs(5));

    let input = serde_json::json!({ "file_path": "/etc/passwd" });
    let outcome = executor.run("Read", &input).await;

    assert!(outcome.is_error);
    assert_eq!(outcome.content, "path outside sandbox");
}
