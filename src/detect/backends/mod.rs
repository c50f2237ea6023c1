mod stub;
mod tract;

pub use stub::StubBackend;
pub use tract::TractBackend;
