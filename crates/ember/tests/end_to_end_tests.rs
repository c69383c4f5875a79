// Integration tests across ember-core and ember-nn
//
// These tests drive the public facade the way a caller would: build a small
// graph, run backward, take a gradient step, and run a transformer block on
// a device next to the autograd path.

use ember::prelude::*;
use ember::ErrorKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// loss = sum(softmax(layer_norm(x·W, g, b)) * target)
fn loss_of(x: &Tensor, w: &Tensor, g: &Tensor, b: &Tensor, target: &Tensor) -> Result<Tensor> {
    x.matmul(w)?.layer_norm(g, b)?.softmax()?.mul(target)?.sum()
}

#[test]
fn test_gradient_descent_lowers_loss() -> Result<()> {
    init();
    let mut rng = StdRng::seed_from_u64(42);
    let x = Tensor::from_vec(random_vec(&mut rng, 4 * 3), (4, 3))?;
    let mut w_data = random_vec(&mut rng, 3 * 5);
    let g = Tensor::from_vec(vec![1.0; 5], 5)?;
    let b = Tensor::from_vec(vec![0.0; 5], 5)?;
    // pick class 0 in every row; maximizing its probability lowers -loss
    let mut t = vec![0.0f32; 4 * 5];
    for row in t.chunks_mut(5) {
        row[0] = -1.0;
    }
    let target = Tensor::from_vec(t, (4, 5))?;

    let mut losses = Vec::new();
    for _ in 0..20 {
        let w = Tensor::from_vec(w_data.clone(), (3, 5))?.requires_grad_(true);
        let loss = loss_of(&x, &w, &g, &b, &target)?;
        losses.push(loss.item()?);
        loss.backward()?;
        let grad = w.grad().ok_or(Error::GradNotTracked)?;
        for (p, d) in w_data.iter_mut().zip(&grad) {
            *p -= 0.5 * d;
        }
    }
    let (first, last) = (losses[0], losses[losses.len() - 1]);
    assert!(last < first, "loss did not decrease: {first} -> {last}");
    Ok(())
}

#[test]
fn test_backward_on_device_matches_host() -> Result<()> {
    init();
    let dev = Device::new(DeviceConfig::default().with_threads(2))?;
    let mut rng = StdRng::seed_from_u64(5);
    let xd = random_vec(&mut rng, 6);
    let wd = random_vec(&mut rng, 6);

    let run = |device: Option<&Device>| -> Result<(Vec<f32>, Vec<f32>)> {
        let x = Tensor::from_vec(xd.clone(), (2, 3))?.requires_grad_(true);
        let w = Tensor::from_vec(wd.clone(), (3, 2))?.requires_grad_(true);
        let (xs, ws) = match device {
            Some(d) => (x.to_device(d)?, w.to_device(d)?),
            None => (x.clone(), w.clone()),
        };
        xs.matmul(&ws)?.relu()?.scale(2.0)?.sum()?.backward()?;
        Ok((
            x.grad().ok_or(Error::GradNotTracked)?,
            w.grad().ok_or(Error::GradNotTracked)?,
        ))
    };

    let host = run(None)?;
    let device = run(Some(&dev))?;
    assert_eq!(host, device);
    Ok(())
}

#[test]
fn test_tensor_pipeline_through_block() -> Result<()> {
    init();
    let dev = Device::new(DeviceConfig::default().with_name("e2e").with_threads(2))?;
    let config = TransformerConfig::new(8, 2, 16);
    let host = HostTransformerBlock::uniform(config, -0.2, 0.2)?;
    let block = TransformerBlock::allocate(&dev, &host)?;

    let x = Tensor::device((4, 8), &dev)?;
    x.random(-1.0, 1.0)?;
    let mut ws = Workspace::new(&dev, block.workspace_len(4, 2))?;
    let y = block.forward_tensor(&x, &mut ws, 2)?;
    assert_eq!(y.residency(), Residency::Device);

    // the block output can feed further tensor ops and come back to the host
    let pooled = y.slice(0, 1, 0)?.to_host()?;
    assert_eq!(pooled.dims(), &[1, 8]);
    assert!(pooled.to_vec()?.iter().all(|v| v.is_finite()));

    drop((x, y, pooled, ws));
    block.free();
    assert_eq!(dev.pool_stats().in_use_bytes, 0);
    Ok(())
}

#[test]
fn test_errors_are_classified() -> Result<()> {
    let a = Tensor::new((2, 3));
    let b = Tensor::new((2, 3));
    assert_eq!(a.matmul(&b).unwrap_err().kind(), ErrorKind::ShapeMismatch);
    assert_eq!(a.slice(0, 4, 1).unwrap_err().kind(), ErrorKind::Bounds);
    assert_eq!(a.backward().unwrap_err().kind(), ErrorKind::GraphState);

    let dev = Device::new(DeviceConfig::default().with_memory_limit(16))?;
    let err = Tensor::device(8, &dev).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    Ok(())
}
