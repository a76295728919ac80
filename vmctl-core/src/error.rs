/// Errors produced by the `vmctl-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The configured mount type cannot be served by the selected driver.
    #[error("field `mountType` must be {allowed} for the {driver} driver, got {got:?}")]
    UnsupportedMountType {
        driver: &'static str,
        allowed: String,
        got: String,
    },

    /// A snapshot tag was empty.
    #[error("expected tag")]
    EmptyTag,

    /// A MAC address string could not be parsed.
    #[error("invalid MAC address {value:?}: {reason}")]
    InvalidMacAddress { value: String, reason: String },
}
