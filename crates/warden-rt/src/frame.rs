//! Logical call frames, native frames, and saved continuations.
//!
//! Instrumented code pushes one [`Frame`] per activation, carrying a static
//! [`Origin`] and a fixed number of capability slots the collector scans as
//! roots. Calls into non-instrumented code push a [`NativeFrame`] that
//! tracks objects kept alive (and possibly pinned) across the call.
//!
//! Setjmp/longjmp is modeled as an explicit saved-continuation record: the
//! frame and native-frame depths at save time, validated against the live
//! stacks at resume time. Resuming a continuation whose frame has already
//! returned is a lifecycle violation, not undefined behavior.

use std::fmt;

use crate::object::ObjectRef;
use crate::violation::{ensure, Violation};

/// Static description of a code location, used in frame traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    /// Function name.
    pub function: &'static str,
    /// Source file.
    pub file: &'static str,
    /// Source line.
    pub line: u32,
}

impl Origin {
    /// Creates an origin record.
    #[must_use]
    pub const fn new(function: &'static str, file: &'static str, line: u32) -> Self {
        Self {
            function,
            file,
            line,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.function, self.file, self.line)
    }
}

/// One instrumented activation: an origin plus its capability slots.
///
/// The slot count is statically known per function; slots start empty and
/// are filled as the function materializes objects it must keep alive.
pub struct Frame {
    origin: Origin,
    objects: Vec<Option<ObjectRef>>,
}

impl Frame {
    fn new(origin: Origin, num_objects: usize) -> Self {
        Self {
            origin,
            objects: vec![None; num_objects],
        }
    }

    /// The frame's origin.
    #[must_use]
    pub const fn origin(&self) -> Origin {
        self.origin
    }

    /// Roots an object in the given slot.
    pub fn set_object(&mut self, slot: usize, object: Option<ObjectRef>) {
        self.objects[slot] = object;
    }

    /// The object rooted in the given slot.
    #[must_use]
    pub fn object(&self, slot: usize) -> Option<ObjectRef> {
        self.objects[slot]
    }
}

/// Objects kept alive (and possibly pinned) across a call into
/// non-instrumented code.
#[derive(Default)]
pub struct NativeFrame {
    tracked: Vec<ObjectRef>,
    pinned: Vec<ObjectRef>,
}

impl NativeFrame {
    /// Keeps `object` alive for the duration of this native frame.
    pub fn track(&mut self, object: ObjectRef) {
        self.tracked.push(object);
    }

    /// Pins `object` for the duration of this native frame. The matching
    /// unpin runs when the frame is popped.
    pub fn pin(&mut self, object: ObjectRef) -> Result<(), Violation> {
        object.pin()?;
        self.pinned.push(object);
        Ok(())
    }

    fn release_pins(&mut self) {
        for object in self.pinned.drain(..) {
            object.unpin();
        }
    }
}

/// The per-thread frame state: the instrumented frame stack plus the native
/// frame stack.
#[derive(Default)]
pub struct FrameStack {
    frames: Vec<Frame>,
    native: Vec<NativeFrame>,
}

impl FrameStack {
    /// Pushes an instrumented frame with `num_objects` capability slots.
    pub fn push_frame(&mut self, origin: Origin, num_objects: usize) {
        self.frames.push(Frame::new(origin, num_objects));
    }

    /// Pops the top instrumented frame.
    pub fn pop_frame(&mut self) {
        let popped = self.frames.pop();
        debug_assert!(popped.is_some(), "pop_frame on empty frame stack");
    }

    /// The top instrumented frame.
    pub fn top_frame(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Pushes a native frame.
    pub fn push_native_frame(&mut self) {
        self.native.push(NativeFrame::default());
    }

    /// Pops the top native frame, releasing its pins.
    pub fn pop_native_frame(&mut self) {
        let mut popped = self.native.pop().expect("pop_native_frame on empty stack");
        popped.release_pins();
    }

    /// The top native frame.
    pub fn top_native_frame(&mut self) -> Option<&mut NativeFrame> {
        self.native.last_mut()
    }

    /// Current instrumented-frame depth.
    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Current native-frame depth.
    #[must_use]
    pub fn native_depth(&self) -> usize {
        self.native.len()
    }

    /// Unwinds both stacks to the given depths, releasing pins held by
    /// popped native frames. Used by continuation resume.
    pub fn truncate_to(&mut self, frame_depth: usize, native_depth: usize) {
        debug_assert!(frame_depth <= self.frames.len());
        debug_assert!(native_depth <= self.native.len());
        self.frames.truncate(frame_depth);
        while self.native.len() > native_depth {
            self.pop_native_frame();
        }
    }

    /// Feeds every rooted object to `each`: frame slots, native tracked
    /// objects, and native pins.
    pub fn for_each_root(&self, mut each: impl FnMut(ObjectRef)) {
        for frame in &self.frames {
            for object in frame.objects.iter().flatten() {
                each(*object);
            }
        }
        for native in &self.native {
            for object in &native.tracked {
                each(*object);
            }
            // Pinned objects are almost always tracked too, but enumerate
            // them anyway; missing a root is the one unforgivable bug.
            for object in &native.pinned {
                each(*object);
            }
        }
    }

    /// Renders the frame trace, innermost first.
    #[must_use]
    pub fn dump(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| frame.origin.to_string())
            .collect()
    }
}

/// A saved setjmp continuation: the stack depths at save time plus the
/// owning thread's id.
#[derive(Debug, Clone, Copy)]
pub struct Continuation {
    pub(crate) frame_depth: usize,
    pub(crate) native_depth: usize,
    pub(crate) thread_id: u32,
}

impl Continuation {
    /// Validates this continuation against the live stacks and returns the
    /// depths to unwind to.
    ///
    /// Fails if the continuation belongs to another thread or if the saving
    /// frame has already returned (a stale continuation).
    pub fn validate(
        &self,
        current_thread_id: u32,
        current_frame_depth: usize,
        current_native_depth: usize,
    ) -> Result<(usize, usize), Violation> {
        ensure!(
            self.thread_id == current_thread_id,
            Lifecycle,
            "cannot resume continuation saved on thread {} from thread {}",
            self.thread_id,
            current_thread_id
        );
        ensure!(
            self.frame_depth <= current_frame_depth && self.native_depth <= current_native_depth,
            Lifecycle,
            "cannot resume stale continuation (saved at depth {}, stack is at depth {})",
            self.frame_depth,
            current_frame_depth
        );
        Ok((self.frame_depth, self.native_depth))
    }
}

/// Saves the current continuation into a fresh `JmpBuf` special object and
/// returns a capability to it.
#[must_use]
pub fn setjmp(thread: &crate::thread::Thread) -> crate::ptr::CapPtr {
    let (frame_depth, native_depth) =
        thread.with_frames(|frames| (frames.frame_depth(), frames.native_depth()));
    let continuation = Continuation {
        frame_depth,
        native_depth,
        thread_id: thread.tid(),
    };
    crate::ptr::CapPtr::from_object(crate::heap::allocate_special(
        crate::object::WordType::JmpBuf,
        continuation,
    ))
}

/// Resumes a continuation saved by [`setjmp`]: validates it against the
/// live stacks, then unwinds both stacks (releasing pins held by popped
/// native frames).
///
/// # Errors
///
/// Fails the special access check for non-`JmpBuf` capabilities and the
/// staleness/ownership validation for continuations whose frame has
/// already returned or that belong to another thread.
pub fn longjmp(thread: &crate::thread::Thread, jmp_buf: crate::ptr::CapPtr) -> Result<(), Violation> {
    let continuation =
        crate::heap::special_payload::<Continuation>(jmp_buf, crate::object::WordType::JmpBuf)?;
    thread.with_frames(|frames| {
        continuation
            .validate(thread.tid(), frames.frame_depth(), frames.native_depth())
            .map(|(frame_depth, native_depth)| {
                frames.truncate_to(frame_depth, native_depth);
            })
    })
}

/// Dumps the current thread's frame trace to stderr. Called from the fatal
/// trap path; tolerates running before the runtime is initialized.
pub(crate) fn dump_current_frames_to_stderr() {
    let Some(thread) = crate::thread::Thread::try_current() else {
        return;
    };
    for line in thread.dump_frames() {
        eprintln!("warden:    {line}");
    }
}
