//! AtlasDir CLI Client
//!
//! Command-line interface for talking to a directory server.

use std::process;
use std::time::Duration;

use atlasdir::config::Address;
use atlasdir::protocol::{Attribute, Change, ChangeOp, Scope, SearchRequest};
use atlasdir::{AtlasError, Client, ClientConfig, Notification, Operations, Result, SearchEvent};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// AtlasDir CLI
#[derive(Parser, Debug)]
#[command(name = "atlasdir-cli")]
#[command(about = "CLI for AtlasDir directory servers")]
#[command(version)]
struct Args {
    /// Server address (host:port or a socket path)
    #[arg(short, long, default_value = "127.0.0.1:1389")]
    server: String,

    /// Name to bind as before running the command
    #[arg(short = 'D', long)]
    bind_dn: Option<String>,

    /// Password for --bind-dn
    #[arg(short = 'w', long, default_value = "")]
    password: String,

    /// Per-request timeout in seconds
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ScopeArg {
    Base,
    One,
    Sub,
}

impl From<ScopeArg> for Scope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Base => Scope::Base,
            ScopeArg::One => Scope::OneLevel,
            ScopeArg::Sub => Scope::Subtree,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search below a base name
    Search {
        /// Search base
        base: String,

        /// Filter
        #[arg(default_value = "(objectclass=*)")]
        filter: String,

        /// Search scope
        #[arg(short, long, value_enum, default_value = "sub")]
        scope: ScopeArg,

        /// Attributes to return (all if omitted)
        #[arg(short, long)]
        attributes: Vec<String>,
    },

    /// Add an entry
    Add {
        /// Name of the new entry
        dn: String,

        /// Attributes as name=value (repeat a name for more values)
        #[arg(required = true)]
        attributes: Vec<String>,
    },

    /// Delete an entry
    Delete {
        /// The entry to delete
        dn: String,
    },

    /// Replace attribute values on an entry
    Modify {
        /// The entry to change
        dn: String,

        /// New values as name=value
        #[arg(required = true)]
        attributes: Vec<String>,
    },

    /// Rename an entry
    Rename {
        /// Current name
        dn: String,

        /// New name
        new_dn: String,

        /// Remove the old leaf value from the entry
        #[arg(long)]
        delete_old: bool,
    },

    /// Compare an attribute value
    Compare {
        dn: String,
        attribute: String,
        value: String,
    },

    /// Ask the server who this connection is bound as
    Whoami,
}

/// Group name=value pairs into attributes, in first-seen order
fn parse_attributes(pairs: &[String]) -> Result<Vec<Attribute>> {
    let mut attributes: Vec<Attribute> = Vec::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| AtlasError::Config(format!("expected name=value, got '{}'", pair)))?;
        match attributes.iter_mut().find(|attr| attr.is_named(name)) {
            Some(attr) => attr.values.push(value.as_bytes().to_vec()),
            None => attributes.push(Attribute::new(name, [value])),
        }
    }
    Ok(attributes)
}

fn print_entry(entry: &atlasdir::protocol::SearchEntry) {
    println!("dn: {}", entry.object_name);
    for attr in &entry.attributes {
        for value in attr.text_values() {
            println!("{}: {}", attr.name, value);
        }
    }
    println!();
}

fn run(client: &Client, command: Commands) -> Result<()> {
    match command {
        Commands::Search {
            base,
            filter,
            scope,
            attributes,
        } => {
            let request = SearchRequest::new(base, filter)
                .scope(scope.into())
                .attributes(attributes);
            let mut count = 0;
            for event in client.search(request)? {
                match event {
                    SearchEvent::Entry(entry) => {
                        print_entry(&entry);
                        count += 1;
                    }
                    SearchEvent::Reference(uris) => {
                        for uri in uris {
                            println!("ref: {}", uri);
                        }
                    }
                    SearchEvent::End(_) => {}
                    SearchEvent::Error(e) => return Err(e),
                }
            }
            println!("# {} entries", count);
        }
        Commands::Add { dn, attributes } => {
            client.add(&dn, parse_attributes(&attributes)?)?;
            println!("added {}", dn);
        }
        Commands::Delete { dn } => {
            client.delete(&dn)?;
            println!("deleted {}", dn);
        }
        Commands::Modify { dn, attributes } => {
            let changes = parse_attributes(&attributes)?
                .into_iter()
                .map(|attr| Change::new(ChangeOp::Replace, attr))
                .collect();
            client.modify(&dn, changes)?;
            println!("modified {}", dn);
        }
        Commands::Rename {
            dn,
            new_dn,
            delete_old,
        } => {
            client.modify_dn(&dn, &new_dn, delete_old)?;
            println!("renamed {} to {}", dn, new_dn);
        }
        Commands::Compare {
            dn,
            attribute,
            value,
        } => {
            let matched = client.compare(&dn, &attribute, value.as_bytes())?;
            println!("{}", if matched { "TRUE" } else { "FALSE" });
        }
        Commands::Whoami => {
            let response = client.extended(WHOAMI_OID, None)?;
            let identity = response
                .value
                .map(|value| String::from_utf8_lossy(&value).into_owned())
                .unwrap_or_default();
            if identity.is_empty() {
                println!("anonymous");
            } else {
                println!("{}", identity);
            }
        }
    }
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let address = match Address::parse(&args.server) {
        Ok(address) => address,
        Err(e) => {
            tracing::error!("Invalid server address: {}", e);
            process::exit(1);
        }
    };

    let mut config = ClientConfig::builder()
        .address(address)
        .timeout(Duration::from_secs(args.timeout))
        .connect_timeout(Duration::from_secs(args.timeout));
    if let Some(dn) = &args.bind_dn {
        config = config.bind_credentials(dn.clone(), args.password.as_bytes());
    }

    let builder = Client::builder(config.build());
    let notifications = builder.subscribe();
    let client = match builder.start() {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Failed to start client: {}", e);
            process::exit(1);
        }
    };

    let outcome = run(&client, args.command);
    if let Err(e) = client.unbind() {
        tracing::debug!("unbind failed: {}", e);
    }
    client.destroy();

    if let Err(e) = outcome {
        // A request that never reached the server: report why
        let cause = notifications.try_iter().find_map(|notification| match notification {
            Notification::ConnectError(error) | Notification::SetupError(error) => Some(error),
            _ => None,
        });
        match (&e, cause) {
            (AtlasError::NotConnected, Some(cause)) => eprintln!("error: {}", cause),
            _ => eprintln!("error: {}", e),
        }
        process::exit(1);
    }
}
