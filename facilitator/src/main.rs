use std::{env, io, path::PathBuf};

use facilitator::{
    Backend, FacilitatorConfig, FacilitatorErr, FacilitatorManager, SegmentTrainer,
    bus::accept_peers, config::load_segment,
};
use log::{error, info};
use tokio::{net::TcpListener, signal};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = FacilitatorConfig::from_env()?;
    let Backend::Tcp { listen } = *config.backend() else {
        return Err(FacilitatorErr::InvalidConfig(
            "the memory backend only works in-process, use BACKEND=tcp".into(),
        )
        .into());
    };

    let segment_path = env::var_os("SEGMENT").map(PathBuf::from);
    let spec = load_segment(segment_path.as_deref())?;
    let trainer = SegmentTrainer::from_spec(&spec).map_err(io::Error::other)?;
    info!(
        rank = config.rank(),
        in_dim = trainer.in_dim(),
        out_dim = trainer.out_dim();
        "segment ready"
    );

    let listener = TcpListener::bind(listen).await?;
    info!("listening at {listen}");

    let mut bus = accept_peers(&config, &listener).await?;
    let mut manager = FacilitatorManager::new(config, trainer)?;

    let res = tokio::select! {
        ret = manager.run(&mut bus) => ret.map(|metrics| {
            info!("wrapping up, took {:?} of compute", metrics.compute_time);
        }),
        _ = signal::ctrl_c() => {
            info!("received SIGTERM");
            Ok(())
        }
    };

    if let Err(e) = &res {
        error!("facilitator failed: {e}");
    }

    bus.close().await?;
    res.map_err(io::Error::from)
}
