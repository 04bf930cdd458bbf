use dspcompiler_backend::*;

fn t(s: &str) -> ActionTime {
    s.parse().unwrap()
}

fn dsp_compiler() -> ProfileCompiler {
    let mut map = ChannelMap::new();
    map.add_digital_line("light_488", 0).unwrap();
    map.add_digital_line("camera_A", 1).unwrap();
    map.add_analog_line("z piezo", AnalogLine::linear(0, 0.5)).unwrap();
    map.add_analog_line("x piezo", AnalogLine::linear(2, 0.25)).unwrap();
    ProfileCompiler::new(map, HardwareVariant::Dsp)
}

#[test]
fn end_to_end_two_lines() {
    let compiler = dsp_compiler();
    let table = vec![
        TableEntry::new(t("0"), "light_488", true),
        TableEntry::new(t("0"), "camera_A", true),
        TableEntry::new(t("10"), "light_488", false),
        TableEntry::new(t("10"), "camera_A", false),
    ];
    let out = compiler
        .compile_table(&table, None, &Baseline::default())
        .unwrap();
    assert_eq!(
        out.profile.digital,
        vec![DigitalRow::new(0, 0b11), DigitalRow::new(100, 0b00)]
    );
    assert_eq!(out.profile.runtime(), 100);
    for table in out.profile.analog.iter() {
        assert_eq!(table, &vec![AnalogRow::new(0, 0)]);
    }
    assert_eq!(out.profile.header.n_digital, 2);
    assert_eq!(out.profile.header.n_analog, [1, 1, 1, 1]);
    assert_eq!(out.profile.header.clock, 100.);
    assert_eq!(out.profile.header_bytes().len(), HEADER_LEN);
}

#[test]
fn nearby_decimal_times_share_a_tick() {
    let compiler = dsp_compiler();
    let table = vec![
        TableEntry::new(t("0"), "light_488", true),
        TableEntry::new(t("10.1"), "camera_A", true),
        TableEntry::new(t("10.09999999"), "camera_A", true),
        TableEntry::new(t("20"), "light_488", false),
    ];
    let out = compiler
        .compile_table(&table, None, &Baseline::default())
        .unwrap();
    let ticks: Vec<u32> = out.profile.digital.iter().map(|row| row.tick).collect();
    assert_eq!(ticks, vec![0, 101, 200]);
}

#[test]
fn single_action_has_two_rows() {
    let compiler = dsp_compiler();
    let table = vec![TableEntry::new(t("42.5"), "camera_A", true)];
    let out = compiler
        .compile_table(&table, None, &Baseline::default())
        .unwrap();
    assert_eq!(
        out.profile.digital,
        vec![DigitalRow::new(0, 0b10), DigitalRow::new(1, 0b10)]
    );
    assert_eq!(out.next_baseline.last_digital, 0b10);
}

#[test]
fn underflow_on_turning_off_an_off_line() {
    let compiler = dsp_compiler();
    let table = vec![TableEntry::new(t("1"), "light_488", false)];
    let err = compiler
        .compile_table(&table, None, &Baseline::default())
        .unwrap_err();
    assert!(matches!(err, CompileError::DigitalUnderflow { .. }));
    assert!(err.to_string().contains("light_488"));
}

#[test]
fn digital_state_carries_across_profiles() {
    let compiler = dsp_compiler();
    let first = compiler
        .compile_table(
            &[
                TableEntry::new(t("0"), "light_488", true),
                TableEntry::new(t("1"), "camera_A", true),
            ],
            None,
            &Baseline::default(),
        )
        .unwrap();
    assert_eq!(first.next_baseline.last_digital, 0b11);

    let second = compiler
        .compile_table(
            &[
                TableEntry::new(t("5"), "camera_A", false),
                TableEntry::new(t("6"), "light_488", false),
            ],
            None,
            &first.next_baseline,
        )
        .unwrap();
    assert_eq!(second.profile.header.init_dio, 0b11);
    assert_eq!(
        second.profile.digital,
        vec![DigitalRow::new(0, 0b01), DigitalRow::new(10, 0)]
    );
}

#[test]
fn analog_rebase_to_zero() {
    let compiler = dsp_compiler();
    let baseline = Baseline {
        last_digital: 0,
        last_analog: [30, 0, 0, 0],
    };
    // 15 um / 0.5 um per ADU = 30 ADU, which is where the output already is
    let table = vec![
        TableEntry::new(t("0"), "light_488", true),
        TableEntry::new(t("0"), "z piezo", 15.),
        TableEntry::new(t("1"), "light_488", false),
    ];
    let out = compiler.compile_table(&table, None, &baseline).unwrap();
    assert_eq!(out.profile.analog[0], vec![AnalogRow::new(0, 0)]);
    assert_eq!(out.next_baseline.last_analog[0], 30);
}

#[test]
fn trailing_analog_gets_a_digital_row() {
    let compiler = dsp_compiler();
    let table = vec![
        TableEntry::new(t("0"), "light_488", true),
        TableEntry::new(t("5"), "light_488", false),
        TableEntry::new(t("10"), "x piezo", 1.),
    ];
    let out = compiler
        .compile_table(&table, None, &Baseline::default())
        .unwrap();
    assert_eq!(out.profile.analog[2], vec![AnalogRow::new(100, 4)]);
    assert_eq!(out.profile.digital.last(), Some(&DigitalRow::new(101, 0)));
    assert_eq!(out.profile.runtime(), 101);
}

#[test]
fn cache_skips_identical_recompiles() {
    let compiler = dsp_compiler();
    let table = vec![
        TableEntry::new(t("0"), "light_488", true),
        TableEntry::new(t("2"), "z piezo", 3.),
        TableEntry::new(t("4"), "light_488", false),
    ];
    let baseline = Baseline::default();
    let first = compiler
        .compile_table(&table, Some(t("10")), &baseline)
        .unwrap();
    let second = compiler
        .compile_table(&table, Some(t("10")), &baseline)
        .unwrap();
    assert!(should_upload(&first.profile, None));
    assert!(!should_upload(&second.profile, Some(&first.profile)));

    let mut changed = table.clone();
    changed[1].value = ActionValue::Float(3.5);
    let third = compiler
        .compile_table(&changed, Some(t("10")), &baseline)
        .unwrap();
    assert!(should_upload(&third.profile, Some(&first.profile)));
}

#[test]
fn rep_duration_extends_the_runtime() {
    let compiler = dsp_compiler();
    let table = vec![
        TableEntry::new(t("0"), "camera_A", true),
        TableEntry::new(t("1"), "camera_A", false),
    ];
    let out = compiler
        .compile_table(&table, Some(t("25")), &Baseline::default())
        .unwrap();
    assert_eq!(out.profile.runtime(), 250);
    assert_eq!(out.profile.digital.len(), 3);
}

#[test]
fn unknown_handler_is_reported() {
    let compiler = dsp_compiler();
    let table = vec![TableEntry::new(t("3.5"), "polarizer", 1.)];
    let err = compiler
        .compile_table(&table, None, &Baseline::default())
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unhandled handler when generating profile: 'polarizer' at time 3.5"
    );
}

#[test]
fn empty_table_fails_fast() {
    let compiler = dsp_compiler();
    assert_eq!(
        compiler.compile_table(&[], None, &Baseline::default()),
        Err(CompileError::EmptyActions)
    );
}

#[test]
fn fpga_retarder_levels() {
    let mut map = ChannelMap::new();
    map.add_digital_line("camera", 0).unwrap();
    // 2^16 ADU over a 20 V range
    map.add_analog_line(
        "retarder",
        AnalogLine::indexed(1, vec![0., 1., 2., 3.], 65536. / 20.),
    )
    .unwrap();
    let compiler = ProfileCompiler::new(map, HardwareVariant::CrioFpga);
    let baseline = Baseline {
        last_digital: 0,
        last_analog: [0, 100, 0, 0],
    };
    let table = vec![
        TableEntry::new(t("0"), "retarder", 1.),
        TableEntry::new(t("0"), "camera", true),
        TableEntry::new(t("0.5"), "camera", false),
        TableEntry::new(t("0.5"), "retarder", 3.),
    ];
    let out = compiler.compile_table(&table, None, &baseline).unwrap();
    assert_eq!(
        out.profile.analog[1],
        vec![AnalogRow::new(0, 3276), AnalogRow::new(500, 9830)]
    );
    // No fixup row on the FPGA even though analog reaches the end
    assert_eq!(out.profile.digital.len(), 2);
    assert_eq!(out.next_baseline.last_analog[1], 9830);
}
