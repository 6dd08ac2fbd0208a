// Exit codes for scripted runs
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_GENERIC_FAIL: i32 = 1;
pub const EXIT_CONFIG_FAIL: i32 = 2;

/// Map a failed command to its exit code.
pub fn code_for(err: &anyhow::Error) -> i32 {
    use convlab_common::{ConfigError, ConvLabError};

    let is_config = err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || cause.downcast_ref::<ConvLabError>().is_some_and(ConvLabError::is_config)
    });
    if is_config { EXIT_CONFIG_FAIL } else { EXIT_GENERIC_FAIL }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use convlab_common::{ConfigError, ConvLabError, KernelError};

    #[test]
    fn config_errors_map_to_config_code() {
        let err = anyhow::Error::new(ConfigError::Validation("bad".into()));
        assert_eq!(code_for(&err), EXIT_CONFIG_FAIL);

        let missing = ConfigError::AcceleratorNotCompiled { operation: "forward".into() };
        let wrapped: anyhow::Result<()> =
            Err(ConvLabError::from(missing)).context("building layer");
        assert_eq!(code_for(&wrapped.unwrap_err()), EXIT_CONFIG_FAIL);
    }

    #[test]
    fn other_errors_map_to_generic_code() {
        let err = anyhow::Error::new(ConvLabError::from(KernelError::NoProvider));
        assert_eq!(code_for(&err), EXIT_GENERIC_FAIL);
        assert_eq!(code_for(&anyhow::anyhow!("boom")), EXIT_GENERIC_FAIL);
    }
}
