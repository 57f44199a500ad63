mod config;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    api::FileUpload,
    flows::{register_account, sign_in_and_refresh, RoleAssignment},
    guard::{self, RouteDecision},
    ApiClient, ApiClientError, GoTrueConfig, GoTrueProvider, Session, SessionController,
};
use config::{load_settings, session_database_url};
use serde_json::Value;
use shared::{
    domain::{ProfileRole, UserId},
    protocol::RoleUpdate,
};
use storage::Storage;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "csaas", about = "Cybersecurity-as-a-Service command line client")]
struct Args {
    /// Overrides the Supabase project URL from settings.
    #[arg(long, global = true)]
    supabase_url: Option<String>,
    /// Overrides the CSaaS API base URL from settings.
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "CSAAS_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long, env = "CSAAS_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, default_value = "sme")]
        role: ProfileRole,
    },
    Logout,
    Health,
    #[command(flatten)]
    Protected(ProtectedCommand),
}

/// Commands that need a signed-in session.
#[derive(Subcommand, Debug)]
enum ProtectedCommand {
    Whoami,
    Dashboard,
    #[command(subcommand)]
    Vendors(VendorCommand),
    Scan {
        #[arg(long)]
        target: String,
    },
    Report {
        #[arg(long = "type")]
        report_type: String,
    },
    Analyze {
        file: PathBuf,
    },
    #[command(subcommand)]
    Users(UserCommand),
    SetRole {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        role: ProfileRole,
    },
}

#[derive(Subcommand, Debug)]
enum VendorCommand {
    List,
    Show {
        id: String,
    },
    Create {
        /// Vendor record as JSON.
        #[arg(long)]
        data: String,
    },
    Update {
        id: String,
        #[arg(long)]
        data: String,
    },
    Evidence {
        id: String,
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    List,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.supabase_url {
        settings.supabase_url = url;
    }
    if let Some(url) = args.api_url {
        settings.api_url = url;
    }

    let database_url = session_database_url(&settings.session_database_url);
    let store = Storage::new(&database_url).await.map_err(|error| {
        error!(%database_url, %error, "session-store: failed to open");
        error
    })?;
    let provider = GoTrueProvider::new(
        GoTrueConfig::new(&settings.supabase_url, &settings.supabase_anon_key),
        Arc::new(store),
    )?;
    let api = ApiClient::new(&settings.api_url)?;

    let controller = SessionController::new(Arc::new(provider));
    controller.initialize().await;

    let code = run(args.command, &controller, &api).await;
    controller.shutdown().await;
    code
}

async fn run(command: Command, controller: &SessionController, api: &ApiClient) -> Result<ExitCode> {
    match command {
        Command::Login { email, password } => {
            match sign_in_and_refresh(controller, &email, &password).await {
                Ok(session) => {
                    println!("Signed in as {}", display_user(&session));
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("Sign-in failed: {}", err.user_message());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Signup {
            email,
            password,
            role,
        } => match register_account(controller, api, &email, &password, role).await {
            Ok(registration) => {
                if registration.outcome.needs_verification() {
                    println!("Account created. Check {email} for a verification link, then sign in.");
                } else {
                    println!("Account created and signed in.");
                }
                if let RoleAssignment::Failed(err) = &registration.role_assignment {
                    eprintln!("Warning: the '{role}' role could not be recorded ({err}). Contact an administrator.");
                }
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                eprintln!("Sign-up failed: {}", err.user_message());
                Ok(ExitCode::FAILURE)
            }
        },
        Command::Logout => {
            controller.sign_out().await;
            println!("Signed out.");
            Ok(ExitCode::SUCCESS)
        }
        Command::Health => {
            let health = api.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Protected(protected) => {
            let Some(session) = protected_session(controller).await else {
                eprintln!("Not signed in. Run `csaas login --email <EMAIL>` first.");
                return Ok(ExitCode::from(2));
            };
            match run_protected(protected, &session, api).await {
                Ok(()) => Ok(ExitCode::SUCCESS),
                Err(err) => match err.downcast_ref::<ApiClientError>() {
                    Some(ApiClientError::Unauthorized) => {
                        eprintln!("Your session was rejected. Run `csaas login` to sign in again.");
                        Ok(ExitCode::from(2))
                    }
                    Some(ApiClientError::Forbidden(detail)) => {
                        eprintln!("Not permitted: {detail}");
                        Ok(ExitCode::FAILURE)
                    }
                    _ => Err(err),
                },
            }
        }
    }
}

async fn protected_session(controller: &SessionController) -> Option<Session> {
    match guard::resolve(controller).await {
        RouteDecision::Render => controller.state().session().cloned(),
        RouteDecision::Wait | RouteDecision::Redirect(_) => {
            info!("auth: protected command without a session");
            None
        }
    }
}

async fn run_protected(command: ProtectedCommand, session: &Session, api: &ApiClient) -> Result<()> {
    match command {
        ProtectedCommand::Whoami => {
            println!("{}", display_user(session));
            if let Some(expires_at) = session.expires_at {
                println!("session expires at {expires_at}");
            }
        }
        ProtectedCommand::Dashboard => {
            let dashboard = api.dashboard_summary(session).await?;
            println!("{}", serde_json::to_string_pretty(&dashboard)?);
        }
        ProtectedCommand::Vendors(VendorCommand::List) => {
            print_json(&Value::Array(api.list_vendors(session).await?))?;
        }
        ProtectedCommand::Vendors(VendorCommand::Show { id }) => {
            print_json(&api.get_vendor(session, &id).await?)?;
        }
        ProtectedCommand::Vendors(VendorCommand::Create { data }) => {
            let vendor = parse_json(&data)?;
            print_json(&api.create_vendor(session, &vendor).await?)?;
        }
        ProtectedCommand::Vendors(VendorCommand::Update { id, data }) => {
            let vendor = parse_json(&data)?;
            print_json(&api.update_vendor(session, &id, &vendor).await?)?;
        }
        ProtectedCommand::Vendors(VendorCommand::Evidence { id, file }) => {
            let upload = read_upload(&file).await?;
            print_json(&api.upload_vendor_evidence(session, &id, upload).await?)?;
        }
        ProtectedCommand::Scan { target } => {
            let scan = api.initiate_scan(session, &target).await?;
            println!("{}", serde_json::to_string_pretty(&scan)?);
        }
        ProtectedCommand::Report { report_type } => {
            let report = api.generate_report(session, &report_type).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ProtectedCommand::Analyze { file } => {
            let upload = read_upload(&file).await?;
            print_json(&api.analyze_content(session, upload).await?)?;
        }
        ProtectedCommand::Users(UserCommand::List) => {
            let users = api.list_users(session).await?;
            println!("{}", serde_json::to_string_pretty(&users)?);
        }
        ProtectedCommand::SetRole { user_id, role } => {
            let response = api
                .set_user_role(Some(session), &RoleUpdate { user_id, role })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

fn display_user(session: &Session) -> String {
    match &session.user.email {
        Some(email) => format!("{email} ({})", session.user.id),
        None => session.user.id.to_string(),
    }
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("--data must be a JSON document")
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_upload(path: &Path) -> Result<FileUpload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let mime_type = mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string());
    Ok(FileUpload {
        filename,
        mime_type,
        bytes,
    })
}
