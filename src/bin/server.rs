//! AtlasDir Server Binary
//!
//! Serves an in-memory directory tree under one suffix.

use std::collections::BTreeMap;
use std::sync::Arc;

use atlasdir::config::Address;
use atlasdir::name::{split_leaf, DirName};
use atlasdir::protocol::{Attribute, ChangeOp, OpCode, Request, ResultCode, Scope, SearchEntry};
use atlasdir::server::{Handler, MatchRule, Next, RequestContext, ResponseWriter};
use atlasdir::{AtlasError, Router, Server, ServerConfig};
use clap::Parser;
use parking_lot::RwLock;
use tracing_subscriber::{fmt, EnvFilter};

/// "Who am I?" extended operation
const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// AtlasDir Server
#[derive(Parser, Debug)]
#[command(name = "atlasdir-server")]
#[command(about = "In-memory directory server")]
#[command(version)]
struct Args {
    /// Listen address (host:port or a socket path)
    #[arg(short, long, default_value = "127.0.0.1:1389")]
    listen: String,

    /// Naming context served by this instance
    #[arg(short, long, default_value = "dc=example")]
    suffix: String,

    /// Administrator bind name
    #[arg(long, default_value = "cn=root")]
    root_dn: String,

    /// Administrator password
    #[arg(long, default_value = "secret")]
    root_password: String,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,
}

#[derive(Debug, Clone)]
struct Stored {
    dn: String,
    attributes: Vec<Attribute>,
}

impl Stored {
    fn entry(&self) -> SearchEntry {
        SearchEntry {
            object_name: self.dn.clone(),
            attributes: self.attributes.clone(),
        }
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|attr| attr.is_named(name))
    }
}

type Tree = Arc<RwLock<BTreeMap<DirName, Stored>>>;

fn operation(code: ResultCode, message: impl Into<String>) -> Next {
    Next::Abort(AtlasError::operation(code, message))
}

/// Minimal filter support: `(attr=*)`, `(attr=value)`, anything else matches
fn matches_filter(stored: &Stored, filter: &str) -> bool {
    let inner = filter.trim().trim_start_matches('(').trim_end_matches(')');
    let Some((attr, value)) = inner.split_once('=') else {
        return true;
    };
    if attr.contains(['&', '|', '!']) {
        return true;
    }
    let Some(found) = stored.attributes.iter().find(|a| a.is_named(attr.trim())) else {
        return false;
    };
    value == "*"
        || found
            .values
            .iter()
            .any(|v| String::from_utf8_lossy(v).eq_ignore_ascii_case(value))
}

fn in_scope(base: &DirName, scope: Scope, name: &DirName) -> bool {
    match scope {
        Scope::Base => base == name,
        Scope::OneLevel => base.is_suffix_of(name) && name.len() == base.len() + 1,
        Scope::Subtree => base.is_suffix_of(name),
    }
}

fn register_handlers(
    router: &mut Router,
    tree: Tree,
    suffix: &str,
    root_dn: &str,
    password: String,
) -> atlasdir::Result<()> {
    let rule = MatchRule::suffix(suffix)?;

    router.bind(MatchRule::exact(root_dn)?, move |ctx, _res| match &ctx.request {
        Request::Bind(bind) if bind.credentials == password.as_bytes() => Next::Done,
        _ => operation(ResultCode::InvalidCredentials, "invalid credentials"),
    });

    // Anonymous
    router.bind(MatchRule::Exact(DirName::root()), |ctx, _res| match &ctx.request {
        Request::Bind(bind) if bind.credentials.is_empty() => Next::Done,
        _ => operation(ResultCode::InvalidCredentials, "invalid credentials"),
    });

    let require_bind: Handler = Arc::new(|ctx: &RequestContext, _res: &mut ResponseWriter| {
        if ctx.bound_dn.is_empty() {
            operation(ResultCode::InsufficientAccessRights, "bind required")
        } else {
            Next::Continue
        }
    });

    let store = Arc::clone(&tree);
    let add: Handler = Arc::new(move |ctx: &RequestContext, _res: &mut ResponseWriter| {
        let Request::Add(add) = &ctx.request else {
            return Next::Continue;
        };
        let mut tree = store.write();
        if tree.contains_key(&ctx.target) {
            return operation(ResultCode::EntryAlreadyExists, add.entry.clone());
        }
        tree.insert(
            ctx.target.clone(),
            Stored {
                dn: add.entry.clone(),
                attributes: add.attributes.clone(),
            },
        );
        tracing::info!(dn = %add.entry, "entry added");
        Next::Done
    });
    router.register(
        OpCode::AddRequest,
        rule.clone(),
        vec![require_bind.clone(), add],
    );

    let store = Arc::clone(&tree);
    router.search(rule.clone(), move |ctx, res| {
        let Request::Search(search) = &ctx.request else {
            return Next::Continue;
        };
        let tree = store.read();
        if search.scope == Scope::Base && !tree.contains_key(&ctx.target) {
            return operation(ResultCode::NoSuchObject, search.base.clone());
        }
        let mut sent = 0u32;
        for (name, stored) in tree.iter() {
            if !in_scope(&ctx.target, search.scope, name) || !matches_filter(stored, &search.filter) {
                continue;
            }
            if search.size_limit > 0 && sent >= search.size_limit {
                return operation(ResultCode::SizeLimitExceeded, "size limit exceeded");
            }
            if res.send_entry(stored.entry()).is_err() {
                return Next::Done;
            }
            sent += 1;
        }
        Next::Done
    });

    let store = Arc::clone(&tree);
    router.compare(rule.clone(), move |ctx, res| {
        let Request::Compare(compare) = &ctx.request else {
            return Next::Continue;
        };
        let tree = store.read();
        let Some(stored) = tree.get(&ctx.target) else {
            return operation(ResultCode::NoSuchObject, compare.entry.clone());
        };
        let matched = stored
            .attributes
            .iter()
            .find(|attr| attr.is_named(&compare.attribute))
            .is_some_and(|attr| attr.values.iter().any(|v| *v == compare.value));
        match res.end_compare(matched) {
            Ok(()) => Next::Done,
            Err(e) => Next::Abort(e),
        }
    });

    let store = Arc::clone(&tree);
    let delete: Handler = Arc::new(move |ctx: &RequestContext, _res: &mut ResponseWriter| {
        let mut tree = store.write();
        if tree.keys().any(|name| name != &ctx.target && ctx.target.is_suffix_of(name)) {
            return operation(ResultCode::UnwillingToPerform, "entry has children");
        }
        match tree.remove(&ctx.target) {
            Some(stored) => {
                tracing::info!(dn = %stored.dn, "entry deleted");
                Next::Done
            }
            None => operation(ResultCode::NoSuchObject, ctx.request.target().to_string()),
        }
    });
    router.register(
        OpCode::DelRequest,
        rule.clone(),
        vec![require_bind.clone(), delete],
    );

    let store = Arc::clone(&tree);
    let modify: Handler = Arc::new(move |ctx: &RequestContext, _res: &mut ResponseWriter| {
        let Request::Modify(modify) = &ctx.request else {
            return Next::Continue;
        };
        let mut tree = store.write();
        let Some(stored) = tree.get_mut(&ctx.target) else {
            return operation(ResultCode::NoSuchObject, modify.object.clone());
        };
        for change in &modify.changes {
            let name = change.attribute.name.clone();
            match change.op {
                ChangeOp::Add => match stored.get_mut(&name) {
                    Some(attr) => attr.values.extend(change.attribute.values.iter().cloned()),
                    None => stored.attributes.push(change.attribute.clone()),
                },
                ChangeOp::Delete => {
                    if change.attribute.values.is_empty() {
                        stored.attributes.retain(|attr| !attr.is_named(&name));
                    } else if let Some(attr) = stored.get_mut(&name) {
                        attr.values.retain(|v| !change.attribute.values.contains(v));
                    }
                }
                ChangeOp::Replace => {
                    stored.attributes.retain(|attr| !attr.is_named(&name));
                    if !change.attribute.values.is_empty() {
                        stored.attributes.push(change.attribute.clone());
                    }
                }
            }
        }
        Next::Done
    });
    router.register(
        OpCode::ModifyRequest,
        rule.clone(),
        vec![require_bind.clone(), modify],
    );

    let store = Arc::clone(&tree);
    let rename: Handler = Arc::new(move |ctx: &RequestContext, _res: &mut ResponseWriter| {
        let Request::ModifyDn(rename) = &ctx.request else {
            return Next::Continue;
        };
        let parent = match &rename.new_superior {
            Some(superior) => Some(superior.clone()),
            None => match split_leaf(&rename.entry) {
                Ok((_, parent)) => parent,
                Err(e) => return Next::Abort(e),
            },
        };
        let new_dn = match parent {
            Some(parent) if !parent.is_empty() => format!("{},{}", rename.new_rdn, parent),
            _ => rename.new_rdn.clone(),
        };
        let new_name = match DirName::parse(&new_dn) {
            Ok(name) => name,
            Err(e) => return Next::Abort(e),
        };

        let mut tree = store.write();
        if tree.contains_key(&new_name) {
            return operation(ResultCode::EntryAlreadyExists, new_dn);
        }
        let Some(mut stored) = tree.remove(&ctx.target) else {
            return operation(ResultCode::NoSuchObject, rename.entry.clone());
        };
        stored.dn = new_dn;
        tree.insert(new_name, stored);
        Next::Done
    });
    router.register(
        OpCode::ModifyDnRequest,
        rule,
        vec![require_bind, rename],
    );

    router.extended(WHOAMI_OID, |ctx, res| {
        let identity = if ctx.bound_dn.is_empty() {
            String::new()
        } else {
            format!("dn:{}", ctx.bound_dn)
        };
        match res.end_extended(None, Some(identity.into_bytes())) {
            Ok(()) => Next::Done,
            Err(e) => Next::Abort(e),
        }
    })?;

    router.unbind(|ctx, _res| {
        tracing::debug!(peer = %ctx.peer, "client unbound");
        Next::Done
    });

    Ok(())
}

fn seed(tree: &Tree, suffix: &str) -> atlasdir::Result<()> {
    let name = DirName::parse(suffix)?;
    let rdn_value = name
        .components()
        .first()
        .and_then(|c| c.split_once('='))
        .map(|(_, v)| v.to_string())
        .unwrap_or_default();
    tree.write().insert(
        name,
        Stored {
            dn: suffix.to_string(),
            attributes: vec![
                Attribute::new("objectClass", ["top", "domain"]),
                Attribute::new("dc", [rdn_value]),
            ],
        },
    );
    Ok(())
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlasdir=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("AtlasDir Server v{}", atlasdir::VERSION);
    tracing::info!("Suffix: {}", args.suffix);
    tracing::info!("Listen address: {}", args.listen);

    let listen = match Address::parse(&args.listen) {
        Ok(address) => address,
        Err(e) => {
            tracing::error!("Invalid listen address: {}", e);
            std::process::exit(1);
        }
    };

    let tree: Tree = Arc::new(RwLock::new(BTreeMap::new()));
    let mut router = Router::new();
    let setup = seed(&tree, &args.suffix).and_then(|_| {
        register_handlers(
            &mut router,
            Arc::clone(&tree),
            &args.suffix,
            &args.root_dn,
            args.root_password.clone(),
        )
    });
    if let Err(e) = setup {
        tracing::error!("Failed to set up the directory: {}", e);
        std::process::exit(1);
    }

    let config = ServerConfig::builder()
        .listen(listen)
        .max_connections(args.max_connections)
        .build();

    if let Err(e) = Server::new(config, router).run() {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
}
