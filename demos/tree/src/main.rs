//! Spawns a small task tree, prints the running-tree dump mid-flight, and
//! lets a close handler drain once every worker has finished.
//!
//! Run with `RUST_LOG=trace` to watch the lifecycle engine.

use std::thread::sleep;
use std::time::Duration;

fn main() {
    env_logger::init();

    taskctx::set("batch", String::from("demo-42")).wait();

    taskctx::run(|| {
        let flush = taskctx::close_handler(|| println!("close handler: flushing"));
        taskctx::add_close_handler(&flush);

        for worker in 0u64..3 {
            taskctx::run(move || {
                let batch = taskctx::get("batch").expect("inherited from the root");
                let batch = batch.downcast_ref::<String>().unwrap().clone();
                sleep(Duration::from_millis(50 + worker * 40));
                println!("worker {worker} done with {batch}");
            });
        }

        sleep(Duration::from_millis(30));
        println!("running tree:\n{}", taskctx::get_running());

        taskctx::wait().recv();
        println!("all workers finished");
    });

    taskctx::wait().recv();
    println!("tree closed");
}
