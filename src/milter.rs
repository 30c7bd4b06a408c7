use crate::policy::{Origin, Policy, Transaction, Verdict};
use anyhow::{anyhow, bail, Context as _, Result};
use indymilter::{
    run, Actions, Callbacks, Config as IndyConfig, ContextActions, SetErrorReply, SocketInfo,
    Status,
};
use std::collections::HashMap;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};

/// Where the milter accepts connections from the MTA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// Listening socket handed over on stdin by inetd or a similar supervisor.
    Inherited,
    Unix(PathBuf),
    Tcp(String),
}

impl ListenAddress {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        match spec {
            "" => bail!("empty socket specification"),
            "inetd" | "stdin" | "-" => return Ok(ListenAddress::Inherited),
            _ => {}
        }

        if let Some(path) = spec
            .strip_prefix("unix:")
            .or_else(|| spec.strip_prefix("local:"))
        {
            return Ok(ListenAddress::Unix(PathBuf::from(path)));
        }
        if spec.starts_with('/') {
            return Ok(ListenAddress::Unix(PathBuf::from(spec)));
        }

        for (prefix, bracket) in [("inet:", false), ("inet6:", true)] {
            if let Some(rest) = spec.strip_prefix(prefix) {
                let (port, host) = match rest.split_once('@') {
                    Some((port, host)) => (port, host),
                    None if bracket => (rest, "::"),
                    None => (rest, "0.0.0.0"),
                };
                port.parse::<u16>()
                    .map_err(|_| anyhow!("invalid port in socket specification {spec:?}"))?;
                let address = if bracket {
                    format!("[{host}]:{port}")
                } else {
                    format!("{host}:{port}")
                };
                return Ok(ListenAddress::Tcp(address));
            }
        }

        if spec.contains(':') {
            return Ok(ListenAddress::Tcp(spec.to_string()));
        }
        bail!("unrecognized socket specification {spec:?}")
    }
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Adopt the listening socket on file descriptor 0.
fn inherited_listener() -> Result<Listener> {
    // SAFETY: getsockname only writes into the zeroed storage we own and
    // reports failure for descriptors that are not sockets.
    let family = unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = libc::getsockname(
            0,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        );
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context(
                "stdin is not a listening socket (start from inetd with the 'wait' option)",
            );
        }
        libc::c_int::from(storage.ss_family)
    };

    match family {
        libc::AF_UNIX => {
            // SAFETY: fd 0 is a socket owned by this process for its whole lifetime.
            let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(0) };
            listener.set_nonblocking(true)?;
            Ok(Listener::Unix(UnixListener::from_std(listener)?))
        }
        libc::AF_INET | libc::AF_INET6 => {
            // SAFETY: as above.
            let listener = unsafe { std::net::TcpListener::from_raw_fd(0) };
            listener.set_nonblocking(true)?;
            Ok(Listener::Tcp(TcpListener::from_std(listener)?))
        }
        other => bail!("unsupported socket family {other} on stdin"),
    }
}

async fn bind(address: &ListenAddress) -> Result<Listener> {
    match address {
        ListenAddress::Inherited => inherited_listener(),
        ListenAddress::Unix(path) => {
            // Remove existing socket if it exists
            if path.exists() {
                std::fs::remove_file(path)
                    .with_context(|| format!("removing stale socket {}", path.display()))?;
            }
            let listener = UnixListener::bind(path)
                .with_context(|| format!("binding {}", path.display()))?;
            Ok(Listener::Unix(listener))
        }
        ListenAddress::Tcp(addr) => {
            let listener = TcpListener::bind(addr.as_str())
                .await
                .with_context(|| format!("binding {addr}"))?;
            Ok(Listener::Tcp(listener))
        }
    }
}

/// Per-connection milter state.
pub struct Session {
    txn: Transaction,
    headers: HashMap<String, String>,
}

impl Session {
    fn new(txn: Transaction) -> Self {
        Session {
            txn,
            headers: HashMap::new(),
        }
    }

    fn reset(&mut self) {
        self.txn.reset();
        self.headers.clear();
    }
}

fn status(verdict: Verdict) -> Status {
    match verdict {
        Verdict::Accept => Status::Accept,
        Verdict::Continue => Status::Continue,
        Verdict::TempFail(_) => Status::Tempfail,
    }
}

fn first_arg(args: &[std::ffi::CString]) -> String {
    args.first()
        .map(|arg| arg.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn origin(socket_info: SocketInfo) -> Origin {
    match socket_info {
        SocketInfo::Inet(addr) => Origin::Tcp(addr),
        SocketInfo::Unix(path) => Origin::Local(path.to_string_lossy().into_owned()),
        SocketInfo::Unknown => Origin::Local("unknown".to_string()),
    }
}

fn callbacks(policy: Arc<Policy>) -> Callbacks<Session> {
    Callbacks::new()
        .on_connect(move |ctx, hostname, socket_info| {
            let policy = policy.clone();
            Box::pin(async move {
                let hostname = hostname.to_string_lossy().into_owned();
                let origin = origin(socket_info);
                log::debug!("Connection from: {hostname} ({origin:?})");
                let session = ctx.data.insert(Session::new(policy.transaction()));
                status(session.txn.on_connect(&hostname, origin).await)
            })
        })
        .on_helo(|ctx, name| {
            Box::pin(async move {
                if let Some(session) = ctx.data.as_mut() {
                    session.txn.on_helo(&name.to_string_lossy());
                }
                Status::Continue
            })
        })
        .on_mail(|ctx, args| {
            Box::pin(async move {
                let sender = first_arg(&args);
                let authenticated = ctx
                    .macros
                    .get(c"{auth_authen}")
                    .or_else(|| ctx.macros.get(c"auth_authen"))
                    .map(|user| user.to_string_lossy().into_owned());

                let Some(session) = ctx.data.as_mut() else {
                    return Status::Continue;
                };
                session.headers.clear();
                status(session.txn.on_sender(&sender, authenticated.as_deref()).await)
            })
        })
        .on_rcpt(|ctx, args| {
            Box::pin(async move {
                let recipient = first_arg(&args);
                let Some(session) = ctx.data.as_mut() else {
                    return Status::Continue;
                };
                let verdict = session.txn.on_recipient(&recipient);

                if let Verdict::TempFail(reply) = verdict {
                    if let Err(e) =
                        ctx.reply
                            .set_error_reply(reply.code, Some(reply.status), [reply.text])
                    {
                        log::error!("Failed to set reply {reply}: {e}");
                    }
                }
                status(verdict)
            })
        })
        .on_header(|ctx, name, value| {
            Box::pin(async move {
                if let Some(session) = ctx.data.as_mut() {
                    let name = name.to_string_lossy().to_lowercase();
                    let value = value.to_string_lossy().trim().to_string();
                    session.headers.entry(name).or_insert(value);
                }
                Status::Continue
            })
        })
        .on_eoh(|ctx| {
            Box::pin(async move {
                if let Some(session) = ctx.data.as_mut() {
                    let Session { txn, headers } = session;
                    txn.on_headers(headers);
                }
                Status::Continue
            })
        })
        .on_eom(|ctx| {
            Box::pin(async move {
                let header = ctx.data.as_mut().and_then(|session| session.txn.on_body());

                if let Some((name, value)) = header {
                    log::debug!("Adding header {name}: {value}");
                    if let Err(e) = ctx.actions.add_header(name, value).await {
                        log::error!("Failed to add header: {e}");
                    }
                }
                if let Some(session) = ctx.data.as_mut() {
                    session.reset();
                }
                Status::Continue
            })
        })
        .on_abort(|ctx| {
            Box::pin(async move {
                if let Some(session) = ctx.data.as_mut() {
                    session.reset();
                }
                Status::Continue
            })
        })
}

pub struct Milter {
    policy: Arc<Policy>,
}

impl Milter {
    pub fn new(policy: Arc<Policy>) -> Self {
        Milter { policy }
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Serve until interrupted. Failing to obtain the listener is an error.
    pub async fn run(&self, socket: &str, sweep_interval: std::time::Duration) -> Result<()> {
        let address = ListenAddress::parse(socket)?;
        let listener = bind(&address).await?;
        log::info!("Starting milter on: {socket}");

        let sweeper = tokio::spawn({
            let policy = self.policy.clone();
            async move { policy.greylist().run_sweeper(sweep_interval).await }
        });

        // Configure indymilter to enable ADD_HEADER action
        let config = IndyConfig {
            actions: Actions::ADD_HEADER,
            ..Default::default()
        };
        let callbacks = callbacks(self.policy.clone());
        let shutdown = tokio::signal::ctrl_c();

        let result = match listener {
            Listener::Unix(listener) => run(listener, callbacks, config, shutdown).await,
            Listener::Tcp(listener) => run(listener, callbacks, config, shutdown).await,
        };
        sweeper.abort();

        if let ListenAddress::Unix(path) = &address {
            std::fs::remove_file(path).ok();
        }
        result.context("milter stopped with an error")
    }
}
