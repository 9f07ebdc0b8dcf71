use std::fmt::Debug;

/// Implementors return a plain object with public fields describing their
/// internal state, for debug surfaces and tests.
pub trait Introspect<T>
where
    T: Debug,
{
    fn introspect(&self) -> T;
}
