//! Main vehicle-side executable entry point.
//!
//! # Architecture
//!
//! The executable:
//!
//!     - Creates the session and initialises logging
//!     - Loads the parameters of every module from `$VEH_SW_ROOT/params`
//!     - Loads the route, so that the navigator has a map before the first sample arrives
//!     - Connects to the simulator, launching it first if `net.toml` names a companion process
//!     - Builds the auto pilot and starts the control loops
//!     - Waits for the route to be completed, then brakes to a standstill and disposes of
//!       everything
//!
//! # Usage
//!
//! ```text
//! veh_exec <ROUTE> [--speed <km/h>] [--log-level <level>]
//! ```

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{eyre::WrapErr, Report};
use log::{info, warn};
use std::path::PathBuf;
use structopt::StructOpt;

// Internal
use comms_if::net::NetParams;
use util::{
    logger::{logger_init, LevelFilter},
    session::Session,
};
use veh_lib::{
    auto_pilot::AutoPilot,
    nav::{self, Route, RouteNavigator},
    params::AutoPilotConfig,
    sim_client::SimClient,
};

// ---------------------------------------------------------------------------
// STRUCTS
// ---------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "veh_exec", about = "Follow a route with the simulated vehicle")]
struct Opts {
    /// Route file to follow
    #[structopt(parse(from_os_str))]
    route: PathBuf,

    /// Target speed in km/h, negative to drive backwards
    #[structopt(short, long, default_value = "5.0", allow_hyphen_values = true)]
    speed: f64,

    /// Minimum level of log records, `info`, `debug` or `trace`
    #[structopt(short, long, default_value = "info")]
    log_level: LevelFilter,
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opts = Opts::from_args();

    // ---- EARLY INITIALISATION ----

    let session = Session::new("veh_exec", "sessions").wrap_err("Failed to create the session")?;

    logger_init(opts.log_level, &session).wrap_err("Failed to initialise logging")?;

    info!("Vehicle Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let config = AutoPilotConfig::load().wrap_err("Could not load the auto pilot params")?;
    let net_params: NetParams =
        util::params::load("net.toml").wrap_err("Could not load net params")?;

    info!("Exec parameters loaded");

    // ---- LOAD ROUTE ----

    let route = Route::load(&opts.route)
        .wrap_err_with(|| format!("Failed to load the route {:?}", opts.route))?;
    let navigator = RouteNavigator::with_route(route).wrap_err("Invalid route")?;

    // ---- INITIALISE NETWORK ----

    let transport = SimClient::connect(&net_params).wrap_err("Failed to connect to the simulator")?;

    // ---- INITIALISE AUTO PILOT ----

    let mut auto_pilot = AutoPilot::new(
        transport,
        nav::shared(navigator),
        config,
        Some(&session),
    )
    .wrap_err("Failed to initialise the auto pilot")?;

    let run_result = run(&mut auto_pilot, &opts);

    // ---- SHUTDOWN ----

    if let Err(e) = auto_pilot.dispose() {
        warn!("Error while disposing of the auto pilot: {}", e);
    }

    info!("End of execution");

    session.exit();

    run_result
}

/// Follow the route until it is complete, then bring the vehicle to a stop.
fn run(auto_pilot: &mut AutoPilot, opts: &Opts) -> Result<(), Report> {
    auto_pilot.start().wrap_err("Failed to start the auto pilot")?;
    auto_pilot.set_vehicle_speed(opts.speed);

    auto_pilot.wait().wrap_err("The control loop failed")?;

    info!("Control loop finished, stopping the vehicle");

    auto_pilot.stop().wrap_err("Failed to stop the vehicle")
}
