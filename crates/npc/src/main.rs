use {
    clap::{Parser, Subcommand},
    ninep::{client::Client, om},
    std::io::Write as _,
    tokio::io::AsyncReadExt,
};

mod utils;
use crate::utils::*;

#[derive(Debug, clap::Parser)]
#[command(about = "Command-line 9P2000 client")]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    /// (falls back to $NINEP_ADDRESS)
    #[arg(short, long)]
    address: Option<String>,

    /// File tree to attach to
    #[arg(long, default_value = "")]
    aname: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// List a directory
    Ls {
        path: String,
        /// Long listing with permissions, owner, and size
        #[arg(short, long)]
        long: bool,
    },
    /// Copy a file's contents to stdout
    Read { path: String },
    /// Copy stdin to a file, truncating it first
    Write { path: String },
    /// Append stdin to a file
    Append { path: String },
    /// Create an empty file (permissions in octal)
    Create {
        path: String,
        #[arg(short, long, default_value = "644", value_parser = parse_octal)]
        perm: u32,
    },
    /// Remove a file
    Remove { path: String },
    /// Print a file's metadata
    Stat { path: String },
}

fn parse_octal(arg: &str) -> Result<u32, String> {
    u32::from_str_radix(arg, 8).map_err(|e| e.to_string())
}

async fn read_stdin() -> ninep::Result<Vec<u8>> {
    let mut buf = Vec::new();
    tokio::io::stdin().read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn npc_main(cli: Cli) -> ninep::Result<i32> {
    let address = match cli.address.or_else(|| std::env::var("NINEP_ADDRESS").ok()) {
        Some(address) => address,
        None => return Err(ninep::Error::from("no address: pass -a or set $NINEP_ADDRESS")),
    };

    let client = Client::mount(&address, &cli.aname).await?;

    match cli.cmd {
        Cmd::Ls { path, long } => {
            let mut stats = client.read_dir(&path).await?;
            stats.sort_by(|a, b| a.name.cmp(&b.name));
            for stat in stats {
                if long {
                    println!("{}", ls_line(&stat));
                } else {
                    println!("{}", stat.name);
                }
            }
        }
        Cmd::Read { path } => {
            let mut f = client.open(&path, om::READ).await?;
            let mut chunk = vec![0; 8192];
            let stdout = std::io::stdout();
            let mut stdout = stdout.lock();
            loop {
                let n = client.read(&mut f, &mut chunk).await?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&chunk[..n])?;
            }
            client.clunk(f).await?;
        }
        Cmd::Write { path } => {
            let data = read_stdin().await?;
            let mut f = client.open(&path, om::WRITE | om::TRUNC).await?;
            client.write(&mut f, &data).await?;
            client.clunk(f).await?;
        }
        Cmd::Append { path } => {
            let data = read_stdin().await?;
            let length = client.stat(&path).await?.length;
            let mut f = client.open(&path, om::WRITE).await?;
            f.seek(length);
            client.write(&mut f, &data).await?;
            client.clunk(f).await?;
        }
        Cmd::Create { path, perm } => {
            let f = client.create(&path, perm, om::READ).await?;
            client.clunk(f).await?;
        }
        Cmd::Remove { path } => {
            client.remove(&path).await?;
        }
        Cmd::Stat { path } => {
            let stat = client.stat(&path).await?;
            println!("{}", ls_line(&stat));
        }
    }

    client.unmount().await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = npc_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("npc: {}", e);
        -1
    });

    std::process::exit(exit_code);
}
