// Integration tests for tensor lifecycle: tidy, keep, dispose and variables
//
// Every test counts live tensors through `Engine::memory` before and after,
// so a leak in any scope path shows up as a wrong count.

use tidal::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn live(engine: &Engine<CpuBackend>) -> usize {
    engine.memory().num_tensors
}

// Broadcasting

#[test]
fn test_broadcast_mixed_rank_kernel() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let a = engine.ones(Shape::from((4, 1, 3)), DType::F32)?;
    let b = engine.ones(Shape::from((5, 4, 3, 3)), DType::F32)?;
    let c = engine.add(&a, &b)?;
    assert_eq!(c.dims(), &[5, 4, 3, 3]);
    assert!(engine.read(&c)?.iter().all(|&v| v == 2.0));
    assert_eq!(
        Shape::broadcast_dims(a.shape(), c.shape()),
        vec![1]
    );
    Ok(())
}

#[test]
fn test_broadcast_add_is_commutative() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let a = engine.tensor(&[1.0, 2.0], (2, 1))?;
    let b = engine.tensor(&[10.0, 20.0, 30.0], 3)?;
    let ab = engine.add(&a, &b)?;
    let ba = engine.add(&b, &a)?;
    assert_eq!(ab.shape(), ba.shape());
    assert_eq!(engine.read(&ab)?, engine.read(&ba)?);
    assert_vec_approx(
        &engine.read(&ab)?,
        &[11.0, 21.0, 31.0, 12.0, 22.0, 32.0],
        1e-6,
    );
    Ok(())
}

#[test]
fn test_broadcast_mismatch_is_reported() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let a = engine.zeros(Shape::from((2, 3)), DType::F32)?;
    let b = engine.zeros(Shape::from((4, 5)), DType::F32)?;
    let before = live(&engine);
    let err = engine.mul(&a, &b).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
    assert!(err.to_string().contains("[2, 3]"));
    assert!(err.to_string().contains("[4, 5]"));
    assert_eq!(live(&engine), before);
    Ok(())
}

// Tidy

#[test]
fn test_tidy_keeps_only_the_result() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let before = live(&engine);
    let b = engine.tidy(|e| {
        let a = e.scalar(2.0)?;
        e.square(&a)
    })?;
    assert_eq!(live(&engine), before + 1);
    assert_eq!(engine.read_scalar(&b)?, 4.0);
    Ok(())
}

#[test]
fn test_nested_tidy_releases_each_level() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let x = engine.tensor(&[1.0, 2.0, 3.0], 3)?;
    let before = live(&engine);

    let (outer, inner) = engine.tidy(|e| {
        let scratch = e.exp(&x)?;
        let inner = e.tidy(|e| {
            let t = e.add(&x, &scratch)?;
            let u = e.mul(&t, &t)?;
            e.sum(&u, &[], false)
        })?;
        // scratch and the inner intermediates are gone after the inner tidy
        // except for the inner result.
        let outer = e.neg(&inner)?;
        Ok((outer, inner))
    })?;

    assert_eq!(live(&engine), before + 2);
    let v = engine.read_scalar(&inner)?;
    assert!(approx_eq(engine.read_scalar(&outer)?, -v, 1e-4));
    engine.dispose(&(outer, inner))?;
    assert_eq!(live(&engine), before);
    Ok(())
}

#[test]
fn test_keep_survives_every_enclosing_scope() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let before = live(&engine);
    let mut kept = None;
    engine.tidy(|e| {
        e.tidy(|e| {
            let t = e.fill(Shape::from(2), 7.0, DType::F32)?;
            let _garbage = e.neg(&t)?;
            kept = Some(e.keep(&t)?);
            Ok(())
        })?;
        let _more = e.zeros(Shape::from(4), DType::F32)?;
        Ok(())
    })?;
    let kept = kept.ok_or_else(|| Error::msg("keep did not run"))?;
    assert_eq!(live(&engine), before + 1);
    assert!(engine.is_kept(&kept)?);
    assert_eq!(engine.read(&kept)?, vec![7.0, 7.0]);
    Ok(())
}

#[test]
fn test_failed_tidy_releases_its_tensors() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let a = engine.zeros(Shape::from(3), DType::F32)?;
    let b = engine.zeros(Shape::from(4), DType::F32)?;
    let before = live(&engine);

    let result = engine.tidy(|e| {
        let _t = e.exp(&a)?;
        let _u = e.exp(&b)?;
        e.add(&a, &b)
    });
    assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    assert_eq!(live(&engine), before);
    assert_eq!(engine.scope_depth(), 0);
    Ok(())
}

#[test]
fn test_manual_scopes_and_underflow() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let before = live(&engine);
    let id = engine.start_scope("manual");
    let a = engine.ones(Shape::from(2), DType::F32)?;
    let b = engine.add(&a, &a)?;
    let closed = engine.end_scope(&b)?;
    assert_eq!(closed.id(), id);
    assert_eq!(closed.name(), "manual");
    assert_eq!(closed.state(), tidal::ScopeState::Closed);
    assert!(closed.arena().is_empty());
    assert_eq!(live(&engine), before + 1);
    assert!(engine.is_disposed(&a));
    assert!(matches!(engine.end_scope(&()), Err(Error::ScopeUnderflow)));
    Ok(())
}

// Dispose

#[test]
fn test_double_dispose_is_an_error() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let t = engine.ones(Shape::from(2), DType::F32)?;
    engine.dispose(&t)?;
    assert!(engine.is_disposed(&t));
    assert!(matches!(
        engine.dispose(&t),
        Err(Error::DisposedTensor { .. })
    ));
    assert!(matches!(engine.read(&t), Err(Error::DisposedTensor { .. })));
    assert!(matches!(engine.exp(&t), Err(Error::DisposedTensor { .. })));
    Ok(())
}

#[test]
fn test_disposing_a_returned_tensor_frees_its_buffer() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let start = engine.memory();
    let t = engine.tidy(|e| {
        let x = e.ones(Shape::from(8), DType::F32)?;
        e.mul_scalar(&x, 3.0)
    })?;
    assert_eq!(engine.memory().num_bytes, start.num_bytes + 8 * 4);
    engine.dispose(&t)?;
    assert_eq!(engine.memory(), start);
    Ok(())
}

// Variables

#[test]
fn test_variable_outlives_scope_and_shares_buffer() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let w = engine.tidy(|e| {
        let init = e.tensor(&[1.0, 2.0], 2)?;
        e.variable(&init, true, Some("w"))
    })?;
    // The variable is the only handle left, and it still owns the buffer.
    assert_eq!(engine.memory().num_tensors, 1);
    assert_eq!(engine.memory().num_data_buffers, 1);
    assert_eq!(engine.read(w.tensor())?, vec![1.0, 2.0]);

    let dup = engine.tensor(&[0.0, 0.0], 2)?;
    assert!(matches!(
        engine.variable(&dup, true, Some("w")),
        Err(Error::VariableExists(_))
    ));
    Ok(())
}

#[test]
fn test_assign_swaps_value_in_place() -> tidal::Result<()> {
    let mut engine = Engine::new(CpuBackend::new());
    let init = engine.tensor(&[1.0, 2.0], 2)?;
    let w = engine.variable(&init, true, Some("w"))?;
    engine.dispose(&init)?;

    let id = w.id();
    engine.tidy(|e| {
        let doubled = e.mul_scalar(w.tensor(), 2.0)?;
        e.assign(&w, &doubled)
    })?;
    assert_eq!(engine.get_variable("w")?.id(), id);
    assert_eq!(engine.read(w.tensor())?, vec![2.0, 4.0]);
    assert_eq!(engine.memory().num_tensors, 1);
    assert_eq!(engine.memory().num_data_buffers, 1);

    let wrong = engine.zeros(Shape::from(3), DType::F32)?;
    assert!(matches!(
        engine.assign(&w, &wrong),
        Err(Error::ShapeMismatch { .. })
    ));

    engine.dispose_variable(&w)?;
    assert!(matches!(
        engine.get_variable("w"),
        Err(Error::UnknownVariable(_))
    ));
    Ok(())
}

#[test]
fn test_element_count_checked_on_creation() {
    let mut engine = Engine::new(CpuBackend::new());
    let err = engine.tensor(&[1.0, 2.0, 3.0], (2, 2)).unwrap_err();
    assert!(matches!(
        err,
        Error::ElementCountMismatch {
            expected: 4,
            got: 3,
            ..
        }
    ));
}

#[test]
fn test_config_default_dtype() -> tidal::Result<()> {
    let config = EngineConfig::default().with_dtype(DType::F64);
    let mut engine = Engine::with_config(CpuBackend::with_seed(3), config);
    let t = engine.random_normal(Shape::from(4), 0.0, 1.0)?;
    assert_eq!(t.dtype(), DType::F64);
    assert_eq!(engine.memory().num_bytes, 4 * 8);
    assert!(engine.random_uniform(Shape::from(2), 1.0, 1.0).is_err());
    assert!(engine.random_uniform(Shape::from(2), 0.0, f64::INFINITY).is_err());
    assert!(engine.random_uniform(Shape::from(2), f64::NAN, 1.0).is_err());
    assert_eq!(engine.memory().num_bytes, 4 * 8);
    Ok(())
}

#[test]
fn test_debug_mode_profiles_without_changing_results() -> tidal::Result<()> {
    let config = EngineConfig::default().with_debug(true);
    let mut engine = Engine::with_config(CpuBackend::new(), config);
    assert!(engine.config().debug);
    let x = engine.tensor(&[-1.0, 4.0], 2)?;
    // NaN outputs are reported, not rejected.
    let logs = engine.log(&x)?;
    let values = engine.read(&logs)?;
    assert!(values[0].is_nan());
    assert!((values[1] - 4f64.ln()).abs() < 1e-5);
    let result = engine.gradients(
        |e| {
            let sq = e.square(&x)?;
            e.sum(&sq, &[], false)
        },
        &[&x],
    )?;
    assert_eq!(engine.read(&result.grads[0])?, vec![-2.0, 8.0]);
    Ok(())
}
