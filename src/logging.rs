//! ログ出力の初期化

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{HtrError, Result};

/// tracing のサブスクライバを登録する
///
/// `RUST_LOG` が設定されていればそちらを優先します。
pub fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose))
        .with(filter)
        .try_init()
        .map_err(|e| HtrError::Config(format!("ロガーの初期化に失敗しました: {e}")))?;

    Ok(())
}
