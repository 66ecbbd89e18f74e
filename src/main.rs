use clap::Parser;
use miette::{IntoDiagnostic, Result};
use portcullis::{jobs, settings, storage, web};
use sea_orm_migration::MigratorTrait;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "portcullis",
    version,
    about = "OAuth2 authorization server"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;
    migration::Migrator::up(&db, None).await.into_diagnostic()?;

    ensure_default_user(&db).await?;

    // hourly cleanup; the scheduler must outlive the server
    let _scheduler = jobs::init_scheduler(db.clone()).await?;

    web::serve(web::AppState::new(settings, db)).await?;
    Ok(())
}

async fn ensure_default_user(db: &sea_orm::DatabaseConnection) -> Result<()> {
    if storage::count_users(db).await.into_diagnostic()? == 0 {
        storage::create_user(db, "admin", "password123")
            .await
            .into_diagnostic()?;
        tracing::warn!("Created default user (username: admin, password: password123); change it");
    }
    Ok(())
}
