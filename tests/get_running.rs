//! Checks the shape of the running-tree dump: markers, dotted task paths,
//! spawn sites, and sibling ordering.

use std::thread::sleep;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};

fn scoped(body: impl FnOnce() + Send + 'static) {
    let (done_tx, done_rx) = bounded(1);
    taskctx::run(move || {
        taskctx::separate();
        body();
        taskctx::wait().recv();
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("scoped task did not finish");
}

// Number of task-ID segments in a dump line's dotted path.
fn depth(line: &str) -> usize {
    let path = line
        .split_whitespace()
        .find(|token| token.starts_with('.'))
        .expect("dump line has no dotted path");
    path.matches('.').count()
}

#[test]
fn dump_is_empty_without_descendants() {
    let (tx, rx) = unbounded();
    scoped(move || {
        let _ = tx.send(taskctx::get_running());
    });
    let dump = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(dump.is_empty(), "unexpected dump: {dump:?}");
}

#[test]
fn dump_shows_descendants_with_state_and_spawn_site() {
    let (tx, rx) = unbounded();
    scoped(move || {
        taskctx::run(|| sleep(Duration::from_millis(400)));
        taskctx::run(|| {
            taskctx::run(|| sleep(Duration::from_millis(400)));
        });
        // Give the tree time to spawn fully and the middle task time to
        // end; it stays in the dump while its child is alive.
        sleep(Duration::from_millis(150));
        let _ = tx.send(taskctx::get_running());
    });
    let dump = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.len(), 3, "unexpected dump: {dump:?}");

    for line in &lines {
        assert!(
            line.contains("tests/get_running.rs:"),
            "missing spawn site in {line:?}"
        );
    }

    // The two sleepers are still running, the middle task has ended.
    let running = lines.iter().filter(|l| l.starts_with('▸')).count();
    assert_eq!(running, 2, "unexpected dump: {dump:?}");

    // Two direct children, one grandchild a level deeper.
    let mut depths: Vec<usize> = lines.iter().map(|l| depth(l)).collect();
    depths.sort_unstable();
    assert_eq!(depths, vec![2, 2, 3], "unexpected dump: {dump:?}");
}
