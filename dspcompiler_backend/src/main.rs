use dspcompiler_backend::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), CompileError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut map = ChannelMap::new();
    map.add_digital_line("light_488", 0)?;
    map.add_digital_line("camera_A", 1)?;
    map.add_analog_line("z piezo", AnalogLine::linear(0, 5.9029e-4))?;
    let compiler = ProfileCompiler::new(map, HardwareVariant::Dsp);

    let ms = |s: &str| s.parse::<ActionTime>();
    let table = vec![
        TableEntry::new(ms("0")?, "light_488", true),
        TableEntry::new(ms("0")?, "camera_A", true),
        TableEntry::new(ms("5.25")?, "z piezo", 1.5),
        TableEntry::new(ms("10")?, "light_488", false),
        TableEntry::new(ms("10")?, "camera_A", false),
    ];
    let out = compiler.compile_table(&table, None, &Baseline::default())?;
    println!("{:?}", out.profile.header);
    println!("{:?}", out.next_baseline);
    println!("{:?}", out.profile.calc_signal_nsamps(0, out.profile.runtime(), 11));
    Ok(())
}
