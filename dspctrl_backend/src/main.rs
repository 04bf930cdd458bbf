use std::sync::Arc;
use std::time::Duration;

use dspcompiler_backend::*;
use dspctrl_backend::*;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
name = "DSP"
completion_timeout_ms = 1000

[[digital]]
name = "488 shutter"
bit = 0
kind = "light"

[[digital]]
name = "camera A"
bit = 1
kind = "camera"

[[analog]]
name = "z piezo"
channel = 0
sensitivity = 30.0
"#;

fn main() -> DriverResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = DeviceConfig::from_toml_str(CONFIG)?;
    let bus = Arc::new(EventBus::new());
    let link = Arc::new(LoopbackLink::new());
    let device = Arc::new(SequencerDevice::from_config(&config, link.clone(), bus.clone(), None)?);
    device.subscribe();

    // The loopback card finishes as soon as it is triggered
    let callback = Arc::downgrade(&device);
    link.set_trigger_hook(move || {
        if let Some(device) = callback.upgrade() {
            device.receive_data("done");
        }
    });

    bus.publish(PREPARE_FOR_EXPERIMENT, Payload::None);
    let ms = |s: &str| s.parse::<ActionTime>();
    let table = vec![
        TableEntry::new(ms("0")?, "488 shutter", true),
        TableEntry::new(ms("0")?, "camera A", true),
        TableEntry::new(ms("2.5")?, "z piezo", 1.5),
        TableEntry::new(ms("10")?, "488 shutter", false),
        TableEntry::new(ms("10")?, "camera A", false),
    ];
    for rep in 0..2 {
        let completion = device.execute_table(&table, 0, table.len(), 1, None)?;
        println!("run {}: {:?}, baseline {:?}", rep, completion, device.baseline());
    }
    println!("uploads: {}", link.count("upload_profile"));

    device.toggle_light("488 shutter", true)?;
    device.toggle_camera("camera A", true)?;
    device.set_exposure_time("488 shutter", 12.5)?;
    println!("image exposure: {} ms", device.take_image()?);

    bus.publish(CLEANUP_AFTER_EXPERIMENT, Payload::None);
    device.phase().wait_for(Phase::Idle, Duration::from_millis(100));
    Ok(())
}
