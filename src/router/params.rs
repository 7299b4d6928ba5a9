use std::ops::Range;
use std::sync::Arc;

/// A single captured path parameter.
///
/// The name is shared with the route tree (registration-time data, so the
/// clone is an atomic increment); the value is a byte span into the path the
/// lookup ran against. Keeping spans instead of copies means captures stay
/// valid views into the request's own path storage.
#[derive(Debug, Clone)]
struct Capture {
    name: Arc<str>,
    span: Range<usize>,
}

/// Insertion-ordered list of path parameters captured during route lookup.
///
/// Values resolve against the path that was passed to the lookup; the
/// request owns that path, so captures never outlive it.
#[derive(Debug, Clone, Default)]
pub struct PathParams {
    caps: Vec<Capture>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    pub fn clear(&mut self) {
        self.caps.clear();
    }

    pub(crate) fn push(&mut self, name: Arc<str>, span: Range<usize>) {
        self.caps.push(Capture { name, span });
    }

    /// Resolve the first capture named `name` against the path it was
    /// captured from.
    pub fn get<'p>(&self, path: &'p str, name: &str) -> Option<&'p str> {
        self.caps
            .iter()
            .find(|c| &*c.name == name)
            .map(|c| &path[c.span.clone()])
    }

    /// Resolve all captures in insertion order.
    pub fn resolve<'p>(&self, path: &'p str) -> Vec<(&str, &'p str)> {
        self.caps
            .iter()
            .map(|c| (&*c.name, &path[c.span.clone()]))
            .collect()
    }

    /// Capture names with their byte spans, in insertion order.
    pub fn spans(&self) -> impl Iterator<Item = (&str, Range<usize>)> + '_ {
        self.caps.iter().map(|c| (&*c.name, c.span.clone()))
    }
}
