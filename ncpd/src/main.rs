use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, LevelFilter};
use ncp::Daemon;
use stakker::ActorOwn;

fn install_logger() {
	let filter = env::var("NCP_LOG").ok().and_then(|s| s.parse().ok()).unwrap_or(LevelFilter::Info);

	log::set_max_level(filter);
	let _ = log::set_boxed_logger(Box::new(runtime::logger::Logger));
}

struct Args {
	imp_host: IpAddr,
	imp_port: u16,
	local_port: u16,
}

fn parse_args() -> Option<Args> {
	let mut argv = env::args().skip(1);

	let imp_host = argv.next()?.parse().map_err(|err| error!("Invalid IMP host: {err}")).ok()?;
	let imp_port = argv.next()?.parse().map_err(|err| error!("Invalid IMP port: {err}")).ok()?;
	let local_port = argv.next()?.parse().map_err(|err| error!("Invalid local port: {err}")).ok()?;

	Some(Args { imp_host, imp_port, local_port })
}

fn main() -> ExitCode {
	install_logger();

	let Some(args) = parse_args() else {
		eprintln!("usage: ncpd <imp-host> <imp-port> <local-port>");
		return ExitCode::FAILURE;
	};

	let ipc_path = match env::var_os("NCP") {
		Some(path) => PathBuf::from(path),
		None => {
			error!("NCP environment variable not set (application IPC socket path)");
			return ExitCode::FAILURE;
		}
	};

	let connections = env::var("NCP_CONNECTIONS")
		.ok()
		.and_then(|s| s.parse().ok())
		.unwrap_or(ncp::DEFAULT_CONNECTIONS);

	let mut stakker = runtime::init();
	let s = &mut stakker;

	let daemon = ActorOwn::<Daemon>::new(
		s,
		|cx| Daemon::init(cx, args.imp_host, args.imp_port, args.local_port, ipc_path.clone(), connections),
		stakker::ret_nop(),
	);

	s.run(std::time::Instant::now(), false);

	if daemon.is_dead(s) {
		error!("Daemon failed to initialize");
		return ExitCode::FAILURE;
	}

	let cleanup_path = ipc_path;
	let result = runtime::exec(s, move || {
		let _ = std::fs::remove_file(&cleanup_path);
	});

	drop(daemon);

	if result.is_err() {
		ExitCode::FAILURE
	} else {
		ExitCode::SUCCESS
	}
}
