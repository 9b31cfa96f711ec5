use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use stonenet::{
    setup_tracing, AppResult, HandleFuture, Request, Router, Server, ServerConfig,
};
use tokio::runtime;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    PrintConfig,
}

/// Sends every message on msg id 1 straight back.
struct EchoRouter;

impl Router for EchoRouter {
    fn handle<'a>(&'a self, request: &'a Request) -> HandleFuture<'a> {
        Box::pin(async move {
            let connection = request.connection();
            if let Err(err) = connection
                .write_msg(request.msg_id(), request.data().clone())
                .await
            {
                error!(connection_id = connection.id(), "echo failed: {}", err);
            }
        })
    }
}

fn main() -> AppResult<()> {
    // load .env
    dotenv().ok();

    //setup config
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let mut server_config = ServerConfig::set_up_config(config_path)?;
    match commandline.verbose {
        0 => {}
        1 => server_config.log.level = "info".to_string(),
        2 => server_config.log.level = "debug".to_string(),
        _ => server_config.log.level = "trace".to_string(),
    }

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", server_config);
        return Ok(());
    }

    let _log_guard = setup_tracing(&server_config.log)?;

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    let mut server = Server::new(server_config);
    server.add_router(1, EchoRouter)?;
    rt.block_on(server.serve())?;

    info!("server {} shutdown complete", server.name());
    Ok(())
}
