// Integration tests for device residency
//
// Tensors on a Device must compute exactly what host tensors compute, keep
// their buffers in the device pool, and refuse to mix with tensors that live
// elsewhere.

use ember_core::{Device, DeviceConfig, Error, ErrorKind, Residency, Result, Tensor};

fn device() -> Device {
    let _ = env_logger::builder().is_test(true).try_init();
    Device::new(DeviceConfig::default().with_threads(2)).unwrap()
}

#[test]
fn test_device_tensor_is_zeroed_and_resident() -> Result<()> {
    let dev = device();
    let t = Tensor::device((2, 3), &dev)?;
    assert!(t.is_device());
    assert_eq!(t.residency(), Residency::Device);
    assert_eq!(t.placement(), Some(&dev));
    assert_eq!(t.to_vec()?, vec![0.0; 6]);
    assert_eq!(dev.pool_stats().in_use_bytes, 24);
    Ok(())
}

#[test]
fn test_round_trip_preserves_values() -> Result<()> {
    let dev = device();
    let host = Tensor::from_vec(vec![1.5, -2.0, 3.25, 0.0], (2, 2))?;
    let on_dev = host.to_device(&dev)?;
    assert!(on_dev.is_device());
    let back = on_dev.to_host()?;
    assert_eq!(back.residency(), Residency::Host);
    assert_eq!(back.to_vec()?, host.to_vec()?);
    // the source is untouched by the transfer
    assert!(!host.is_device());
    Ok(())
}

#[test]
fn test_device_matmul_matches_host() -> Result<()> {
    let dev = device();
    let a = Tensor::new((4, 3));
    a.random(-1.0, 1.0)?;
    let b = Tensor::new((3, 5));
    b.random(-1.0, 1.0)?;

    let host = a.matmul(&b)?.to_vec()?;
    let device = a.to_device(&dev)?.matmul(&b.to_device(&dev)?)?;
    assert!(device.is_device());
    assert_eq!(device.to_vec()?, host);
    Ok(())
}

#[test]
fn test_gradient_flows_back_to_host_leaf() -> Result<()> {
    let dev = device();
    let w = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2))?.requires_grad_(true);
    let x = Tensor::from_vec(vec![1.0, 1.0], (1, 2))?.to_device(&dev)?;
    let y = x.matmul(&w.to_device(&dev)?)?;
    let loss = y.sum()?;
    assert!(loss.is_device());
    loss.backward()?;
    // dΣ(x·w)/dw[p][j] = x[p]
    assert_eq!(w.grad().unwrap(), vec![1.0; 4]);
    assert!(x.grad().is_none());
    Ok(())
}

#[test]
fn test_mixed_residency_is_rejected() -> Result<()> {
    let dev = device();
    let other = Device::new(DeviceConfig::default().with_ordinal(1).with_threads(1))?;
    let host = Tensor::new((2, 2));
    let a = Tensor::device((2, 2), &dev)?;
    let b = Tensor::device((2, 2), &other)?;

    let err = a.add(&host).unwrap_err();
    assert!(matches!(err, Error::DeviceMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(a.matmul(&b).is_err());
    assert!(a.add(&Tensor::device((2, 2), &dev)?).is_ok());
    Ok(())
}

#[test]
fn test_dropped_tensors_return_memory_to_pool() -> Result<()> {
    let dev = device();
    {
        let t = Tensor::device(256, &dev)?;
        let _v = t.view((16, 16))?;
        assert_eq!(dev.pool_stats().in_use_bytes, 1024);
    }
    let stats = dev.pool_stats();
    assert_eq!(stats.in_use_bytes, 0);
    assert_eq!(stats.cached_bytes, 1024);

    let _again = Tensor::device(256, &dev)?;
    assert_eq!(dev.pool_stats().hits, 1);
    Ok(())
}

#[test]
fn test_memory_limit_reports_out_of_memory() -> Result<()> {
    let dev = Device::new(DeviceConfig::default().with_memory_limit(64))?;
    let a = Tensor::device(8, &dev)?;
    let err = Tensor::device(16, &dev).unwrap_err();
    assert!(matches!(
        err,
        Error::OutOfDeviceMemory {
            requested: 64,
            available: 32,
            ..
        }
    ));
    // a failed allocation leaves existing tensors usable
    assert_eq!(a.to_vec()?, vec![0.0; 8]);
    Ok(())
}

#[test]
fn test_cache_is_dropped_before_failing() -> Result<()> {
    let dev = Device::new(DeviceConfig::default().with_memory_limit(64))?;
    drop(Tensor::device(12, &dev)?);
    assert_eq!(dev.pool_stats().cached_bytes, 48);
    // 48 cached + 32 requested crosses the limit; the cache makes room
    let _b = Tensor::device(8, &dev)?;
    assert_eq!(dev.pool_stats().cached_bytes, 0);
    Ok(())
}
