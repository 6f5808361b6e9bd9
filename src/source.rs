use async_trait::async_trait;

/// Provider of candidate addresses, drained one at a time by pool `create()`.
///
/// Implementations may be finite (a fixed list) or infinite (a generator);
/// `None` signals exhaustion and fails the triggering create with
/// `SourceExhausted`. Any `Iterator<Item = String>` is a source, so both a
/// `Vec<String>` turned into an iterator and a
/// [`RandomSubnetAddresses`](crate::random::RandomSubnetAddresses) work
/// directly.
#[async_trait]
pub trait AddressSource: Send + 'static {
    async fn next_candidate(&mut self) -> Option<String>;
}

#[async_trait]
impl<I> AddressSource for I
where
    I: Iterator<Item = String> + Send + 'static,
{
    async fn next_candidate(&mut self) -> Option<String> {
        self.next()
    }
}
