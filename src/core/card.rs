use crate::core::config::Config;
use crate::core::ecard;
use crate::core::egk;
use crate::core::error::Result;
use crate::core::family::CardFamily;
use crate::core::record::InsurantRecord;
use crate::core::transport::CardSession;

/// Classify the card in `session` by its ATR and run the matching pipeline
pub async fn read_insurant(session: &mut CardSession, config: &Config) -> Result<InsurantRecord> {
    let family = config
        .atr_table()?
        .classify(session.atr(), config.fallback)?;
    let policy = config.policy(family);

    match family {
        CardFamily::De => egk::read_insurant(session, &policy).await,
        CardFamily::At => ecard::read_insurant(session, &policy).await,
    }
}
