use anyhow::Result;

use super::{Session, sync};
use crate::Context;
use crate::cli::RollbackArgs;

pub async fn run(ctx: &Context, args: RollbackArgs) -> Result<()> {
    let session = Session::open(ctx)?;
    session.require(&args.app)?;
    session.refresh().await?;

    let decision = session
        .controller
        .rollback(&args.app, &args.revision)
        .await?;
    let result = sync::follow(ctx, &session, &args.app, &decision).await;
    session.save()?;
    result
}
