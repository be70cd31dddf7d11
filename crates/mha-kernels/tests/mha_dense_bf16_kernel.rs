//! Dense bf16 attention checked against the reference kernel.
//!
//! One test per case of the driver table
//! (`bs sl_m sl_n head_num head_size has_pmask has_badd nthr expect_to_fail`).
//! Test names follow `TestParams::name()`.

use mha_device_probe::CpuCapabilities;
use mha_test_support::{TestParams, check_result, gen_data};

fn run_case(p: TestParams) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut d = gen_data(&p).expect("operand generation");
    assert!(check_result(&p, &mut d), "case {} failed", p.name());
}

macro_rules! mha_case {
    ($(#[$meta:meta])* $name:ident: $bs:expr, $sl_m:expr, $sl_n:expr, $hn:expr, $hs:expr, $pmask:expr, $badd:expr, $nthr:expr, $fail:expr) => {
        #[test]
        $(#[$meta])*
        fn $name() {
            let p = TestParams::new($bs, $sl_m, $sl_n, $hn, $hs, $pmask, $badd, $nthr, $fail);
            assert_eq!(p.name(), stringify!($name));
            run_case(p);
        }
    };
}

mha_case!(c1_1_64_64_1_32_badd: 1, 64, 64, 1, 32, false, true, 1, false);
mha_case!(c1_2_64_64_1_32_badd: 2, 64, 64, 1, 32, false, true, 1, false);
mha_case!(#[ignore = "large; run with --ignored"] c1_2_1024_1024_1_40_badd: 2, 1024, 1024, 1, 40, false, true, 1, false);
mha_case!(#[ignore = "large; run with --ignored"] c1_2_1024_1024_1_80_badd: 2, 1024, 1024, 1, 80, false, true, 1, false);
mha_case!(c1_2_256_256_1_160_badd: 2, 256, 256, 1, 160, false, true, 1, false);

mha_case!(c1_1_64_32_1_32_badd: 1, 64, 32, 1, 32, false, true, 1, false);
mha_case!(c1_1_64_33_1_32_badd: 1, 64, 33, 1, 32, false, true, 1, false);
mha_case!(c1_1_64_61_1_32_badd: 1, 64, 61, 1, 32, false, true, 1, false);
mha_case!(c1_1_1_61_1_32_badd: 1, 1, 61, 1, 32, false, true, 1, false);
mha_case!(c1_1_1_61_1_32_pmask_badd: 1, 1, 61, 1, 32, true, true, 1, false);
mha_case!(c1_1_1_35_1_64_pmask_badd: 1, 1, 35, 1, 64, true, true, 1, false);
mha_case!(c1_2_1_42_1_64_badd: 2, 1, 42, 1, 64, false, true, 1, false);
mha_case!(c3_1_64_33_1_32_pmask_badd: 1, 64, 33, 1, 32, true, true, 3, false);
mha_case!(c0_1_64_33_1_32_pmask_badd: 1, 64, 33, 1, 32, true, true, 0, false);

// Key lengths that are not a multiple of the key block.
mha_case!(c1_2_256_77_1_160_badd: 2, 256, 77, 1, 160, false, true, 1, false);
mha_case!(c2_2_96_77_1_40_badd: 2, 96, 77, 1, 40, false, true, 2, false);

// Several heads, no optional operands.
mha_case!(c4_2_40_50_4_16: 2, 40, 50, 4, 16, false, false, 4, false);

// Rejected at construction.
mha_case!(c1_1_8_8_1_1024_badd: 1, 8, 8, 1, 1024, false, true, 1, true);

#[test]
fn negative_thread_count_fails() {
    let p = TestParams::new(1, 64, 33, 1, 32, true, true, -1, true);
    assert_eq!(p.name(), "c-1_1_64_33_1_32_pmask_badd");
    run_case(p);
}

#[test]
fn pinned_isa_missing_on_probe_fails() {
    let p = TestParams::new(1, 64, 64, 1, 32, false, true, 1, true)
        .with_isa("avx512")
        .with_probe(CpuCapabilities::scalar_only(4));
    run_case(p);
}

#[test]
fn scalar_probe_runs_scalar_tile_path() {
    let p = TestParams::new(1, 64, 33, 1, 32, true, true, 2, false)
        .with_isa("scalar")
        .with_probe(CpuCapabilities::scalar_only(2));
    run_case(p);
}

#[test]
fn expected_failure_that_succeeds_is_reported() {
    let p = TestParams::new(1, 4, 4, 1, 8, false, true, 1, true);
    let mut d = gen_data(&p).unwrap();
    assert!(!check_result(&p, &mut d));
}
