//! Collection-cycle tracing smoke tests. Only built with the `tracing`
//! feature: `cargo test --features tracing`.
#![cfg(feature = "tracing")]

use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

use warden_rt::thread::Thread;
use warden_rt::{heap, runtime, CapPtr};

#[derive(Clone, Default)]
struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl std::io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CaptureWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn cycle_emits_gc_cycle_span() {
    let writer = CaptureWriter::default();
    let buffer = Arc::clone(&writer.buffer);
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(writer)
        .finish();
    // Global, so the collector thread's spans are captured too.
    tracing::subscriber::set_global_default(subscriber).expect("subscriber installs once");

    let thread = Thread::attach_or_current();
    {
        let _enter = thread.enter_guard();
        let object = heap::allocate(&thread, 64);
        heap::free(&thread, CapPtr::from_object(object)).unwrap();
    }
    runtime().collector.request_and_wait();

    let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    assert!(output.contains("gc_cycle"), "missing cycle span in: {output}");
}
