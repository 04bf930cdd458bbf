use dspcompiler_backend::*;
use proptest::prelude::*;

const LINES: u32 = 6;

fn line_map() -> (ChannelMap, Vec<LineId>) {
    let mut map = ChannelMap::new();
    let lines = (0..LINES)
        .map(|bit| map.add_digital_line(&format!("line{}", bit), bit).unwrap())
        .collect();
    (map, lines)
}

/// Toggle sequences that are consistent with a zero baseline: every line
/// alternates on/off starting with on.
fn toggles() -> impl Strategy<Value = Vec<(u32, i64)>> {
    prop::collection::vec((0..LINES, 1i64..500), 1..40)
}

fn build_actions(lines: &[LineId], toggles: &[(u32, i64)]) -> Vec<Action> {
    let mut state = [false; LINES as usize];
    let mut time = 0;
    toggles
        .iter()
        .map(|&(line, gap)| {
            time += gap;
            state[line as usize] = !state[line as usize];
            Action::digital(ActionTime::new(time, 1), lines[line as usize], state[line as usize])
        })
        .collect()
}

proptest! {
    #[test]
    fn quantization_is_round_half_up(mantissa in -1_000_000i64..1_000_000, scale in 0u32..6, tpm in prop::sample::select(vec![1u32, 10, 1000])) {
        let time = ActionTime::new(mantissa, scale);
        let exact = mantissa as f64 * tpm as f64 / 10f64.powi(scale as i32);
        prop_assert!((time.to_tick(tpm) as f64 - exact).abs() <= 0.5 + 1e-9);
        prop_assert_eq!(time.to_tick(tpm), (exact + 0.5).floor() as i64);
    }

    #[test]
    fn display_parse_roundtrip(mantissa in any::<i64>(), scale in 0u32..=MAX_SCALE) {
        let time = ActionTime::new(mantissa, scale);
        let parsed: ActionTime = time.to_string().parse().unwrap();
        prop_assert_eq!(parsed, time);
    }

    #[test]
    fn grid_is_strictly_increasing_and_long_enough(toggles in toggles()) {
        let (_, lines) = line_map();
        let actions = build_actions(&lines, &toggles);
        let grid = quantize(&actions, 10, None, true).unwrap();
        prop_assert!(grid.len() >= 2);
        prop_assert!(grid.ticks().windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(grid.base_tick(), grid.ticks()[0]);
    }

    #[test]
    fn digital_word_matches_line_states(toggles in toggles()) {
        let (map, lines) = line_map();
        let actions = build_actions(&lines, &toggles);
        let compiler = ProfileCompiler::new(map, HardwareVariant::Dsp);
        let out = compiler.compile(&actions, None, &Baseline::default()).unwrap();

        let mut expected = 0u32;
        for &(line, _) in &toggles {
            expected ^= 1 << line;
        }
        prop_assert_eq!(out.next_baseline.last_digital, expected);
        prop_assert!(out.profile.digital.len() >= 2);
        prop_assert!(out.profile.digital.iter().all(|row| row.mask < 1 << LINES));
        prop_assert_eq!(out.profile.header.n_digital as usize, out.profile.digital.len());
    }

    #[test]
    fn recompiling_never_requires_upload(toggles in toggles()) {
        let (map, lines) = line_map();
        let actions = build_actions(&lines, &toggles);
        let compiler = ProfileCompiler::new(map, HardwareVariant::Dsp);
        let a = compiler.compile(&actions, None, &Baseline::default()).unwrap();
        let b = compiler.compile(&actions, None, &Baseline::default()).unwrap();
        prop_assert!(!should_upload(&b.profile, Some(&a.profile)));
    }
}
