//! Classification of backing-store errors.

use nowcasting_common::NowcastingError;

/// Map a Zarr/storage error into the common taxonomy.
///
/// An I/O error anywhere in the source chain decides transient vs permanent;
/// anything else is a permanent Zarr error.
pub fn zarr_error<E>(context: &str, err: E) -> NowcastingError
where
    E: std::error::Error + 'static,
{
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            let transient = matches!(
                io.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            );
            return NowcastingError::Io {
                transient,
                message: format!("{}: {}", context, err),
            };
        }
        source = e.source();
    }
    NowcastingError::zarr(format!("{}: {}", context, err))
}
