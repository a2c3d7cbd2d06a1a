use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

/// Bytes moved in each direction by [`relay`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Traffic {
	pub sent: u64,
	pub received: u64,
}

/// Shuttles bytes between the two streams until either side closes or
/// errors. Benign teardown errors (peer reset after close) are collapsed
/// into a clean result so callers only see real failures.
pub async fn relay<A, B>(downstream: &mut A, upstream: &mut B) -> io::Result<Traffic>
where
	A: AsyncRead + AsyncWrite + Unpin + ?Sized,
	B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	match tokio::io::copy_bidirectional(downstream, upstream).await {
		Ok((sent, received)) => {
			trace!(sent, received, "relay complete");
			Ok(Traffic { sent, received })
		},
		Err(e) if is_benign_teardown(&e) => Ok(Traffic::default()),
		Err(e) => Err(e),
	}
}

fn is_benign_teardown(e: &io::Error) -> bool {
	matches!(
		e.kind(),
		io::ErrorKind::NotConnected | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
	)
}
