//! Property tests for the dense attention kernels.
//!
//! 1. **Dense vs reference** – tiled bf16 output matches the oracle for any
//!    small shape, optional operand combination and thread count.
//! 2. **Convexity** – every output element lies within the range of V.
//! 3. **Thread invariance** – DST is bit-identical for any worker count.
//! 4. **Key order** – jointly permuting K and V rows leaves DST unchanged.
//! 5. **approx_exp accuracy** – the polynomial tracks `f32::exp`.

use half::bf16;
use mha_common::{MhaDenseIo, with_n_thread};
use mha_kernels::KernelImpl;
use mha_kernels::cpu::approx_exp;
use mha_test_support::{BF16_TOLERANCE, TestParams, check_result, compare_data, gen_data, run_kernel};
use proptest::prelude::*;

fn shape_strategy() -> impl Strategy<Value = TestParams> {
    (1usize..3, 1usize..40, 1usize..40, 1usize..3, 1usize..48, any::<bool>(), any::<bool>(), 1i32..5, any::<u64>())
        .prop_map(|(bs, sl_m, sl_n, hn, hs, pmask, badd, nthr, seed)| {
            TestParams::new(bs, sl_m, sl_n, hn, hs, pmask, badd, nthr, false).with_seed(seed)
        })
}

// ---------------------------------------------------------------------------
// Properties: dense kernel agrees with the reference kernel
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_dense_matches_reference(p in shape_strategy(), stable in any::<bool>(), approx in any::<bool>()) {
        let p = p.with_softmax(approx, stable);
        let mut d = gen_data(&p).unwrap();
        prop_assert!(check_result(&p, &mut d), "case {} approx={} stable={}", p.name(), approx, stable);
    }
}

// ---------------------------------------------------------------------------
// Properties: outputs are convex combinations of V rows
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_output_within_value_range(p in shape_strategy()) {
        let mut d = gen_data(&p).unwrap();
        let _nthr = with_n_thread(p.nthr).unwrap();
        run_kernel(KernelImpl::Dense, &d.op_desc, &mut d.kern, None).unwrap();
        for (i, v) in d.kern.typed::<bf16>(MhaDenseIo::Dst).iter().enumerate() {
            let v = v.to_f32();
            prop_assert!(v.is_finite() && v.abs() <= 1.0 + 1e-2, "dst[{}] = {}", i, v);
        }
    }
}

// ---------------------------------------------------------------------------
// Properties: worker count never changes the result
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_thread_count_invariance(p in shape_strategy(), nthr in 2i32..9) {
        let d = gen_data(&p).unwrap();
        let mut single = d.kern.clone();
        let mut multi = d.kern.clone();
        {
            let _nthr = with_n_thread(1).unwrap();
            run_kernel(KernelImpl::Dense, &d.op_desc, &mut single, None).unwrap();
        }
        {
            let _nthr = with_n_thread(nthr).unwrap();
            run_kernel(KernelImpl::Dense, &d.op_desc, &mut multi, None).unwrap();
        }
        prop_assert_eq!(single.get(MhaDenseIo::Dst), multi.get(MhaDenseIo::Dst));
    }
}

// ---------------------------------------------------------------------------
// Properties: attention is invariant under key permutation
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Reversing the key sequence (K and V together) permutes the softmax
    /// terms only; without bias or mask the output must not move.
    #[test]
    fn prop_key_order_does_not_matter(
        sl_m in 1usize..36,
        sl_n in 1usize..70,
        hs in 1usize..40,
        seed in any::<u64>(),
    ) {
        let p = TestParams::new(1, sl_m, sl_n, 1, hs, false, false, 1, false).with_seed(seed);
        let mut d = gen_data(&p).unwrap();
        let _nthr = with_n_thread(1).unwrap();
        run_kernel(KernelImpl::Dense, &d.op_desc, &mut d.kern, None).unwrap();

        for role in [MhaDenseIo::SrcK, MhaDenseIo::SrcV] {
            let rows = d.refr.typed_mut::<bf16>(role);
            let reversed: Vec<bf16> = rows.chunks(hs).rev().flatten().copied().collect();
            rows.copy_from_slice(&reversed);
        }
        run_kernel(KernelImpl::Dense, &d.op_desc, &mut d.refr, None).unwrap();

        prop_assert!(compare_data::<bf16>(
            d.kern.get(MhaDenseIo::Dst).unwrap(),
            d.refr.get(MhaDenseIo::Dst).unwrap(),
            BF16_TOLERANCE,
        ));
    }
}

// ---------------------------------------------------------------------------
// Properties: approx_exp accuracy
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_approx_exp_tracks_exp(x in -20.0f32..20.0) {
        let (approx, exact) = (approx_exp(x), x.exp());
        let rel = ((approx - exact) / exact).abs();
        prop_assert!(rel < 1e-5, "approx_exp({}) = {} vs {} (rel {})", x, approx, exact, rel);
    }

    #[test]
    fn prop_approx_exp_is_monotonic(a in -80.0f32..80.0, delta in 0.01f32..4.0) {
        prop_assert!(approx_exp(a) <= approx_exp(a + delta));
    }
}
