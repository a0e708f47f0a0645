/// The shape of the state an entry point expects: how many push constants and bindings.
///
/// Layouts are shared between the executables that use them; an executable holds one reference
/// per entry point for as long as it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExecutableLayout {
    push_constants: usize,
    bindings: usize,
}

impl ExecutableLayout {
    pub const fn new(push_constants: usize, bindings: usize) -> Self {
        Self {
            push_constants,
            bindings,
        }
    }

    pub fn push_constants(&self) -> usize {
        self.push_constants
    }

    pub fn bindings(&self) -> usize {
        self.bindings
    }
}
