use approx::assert_abs_diff_eq;
use ndarray::Array2;
use verdemetria::core::{compute_ndvi, NdviParams};
use verdemetria::{Crs, GeoTransform, Raster};

fn band(data: Array2<f32>) -> Raster<f32> {
    let gt = GeoTransform::north_up(500_000.0, 4_600_000.0, 10.0, 10.0);
    Raster::new(data, gt, Crs::from_epsg(32618).expect("EPSG:32618"), None).expect("Failed to build band")
}

/// Deterministic reflectance-like values in [lo, hi)
fn pseudo_random_grid(rows: usize, cols: usize, seed: u64, lo: f32, hi: f32) -> Array2<f32> {
    let mut state = seed;
    Array2::from_shape_fn((rows, cols), |_| {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
        lo + unit * (hi - lo)
    })
}

#[test]
fn test_equal_nonzero_bands_give_zero_everywhere() {
    let _ = env_logger::builder().is_test(true).try_init();

    let values = pseudo_random_grid(32, 32, 7, 1e-4, 1.0);
    let product = compute_ndvi(&band(values.clone()), &band(values), &NdviParams::default())
        .expect("NDVI computation failed");

    assert_eq!(product.valid_count, 32 * 32);
    for v in product.ndvi.data().iter() {
        assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-6);
    }
}

#[test]
fn test_output_stays_within_unit_range() {
    // Includes negative reflectance, which pushes the raw ratio outside [-1, 1]
    let red = pseudo_random_grid(40, 25, 11, -0.3, 1.0);
    let nir = pseudo_random_grid(40, 25, 23, -0.3, 1.0);
    let product = compute_ndvi(&band(red.clone()), &band(nir.clone()), &NdviParams::default())
        .expect("NDVI computation failed");

    let mut expected_flags = 0;
    for ((&r, &n), (&v, &flag)) in red
        .iter()
        .zip(nir.iter())
        .zip(product.ndvi.data().iter().zip(product.out_of_range.iter()))
    {
        if v.is_nan() {
            continue;
        }
        assert!((-1.0..=1.0).contains(&v), "NDVI {} outside [-1, 1]", v);

        let raw = (n as f64 - r as f64) / (n as f64 + r as f64 + 1e-8);
        let needs_clamp = !(-1.0..=1.0).contains(&raw);
        assert_eq!(flag, needs_clamp, "flag mismatch for red={} nir={}", r, n);
        if needs_clamp {
            expected_flags += 1;
        }
    }
    assert_eq!(product.out_of_range_count, expected_flags);
    assert!(expected_flags > 0, "fixture should exercise clamping");
}

#[test]
fn test_documented_scenario() {
    let product = compute_ndvi(
        &band(Array2::from_elem((2, 2), 0.1)),
        &band(Array2::from_elem((2, 2), 0.5)),
        &NdviParams::default(),
    )
    .expect("NDVI computation failed");

    for v in product.ndvi.data().iter() {
        assert_abs_diff_eq!(*v, 0.6667, epsilon = 1e-4);
    }
}

#[test]
fn test_swapping_band_roles_changes_the_result() {
    let red = pseudo_random_grid(8, 8, 3, 0.01, 0.4);
    let nir = pseudo_random_grid(8, 8, 5, 0.4, 0.9);

    let forward = compute_ndvi(&band(red.clone()), &band(nir.clone()), &NdviParams::default())
        .expect("NDVI computation failed");
    let swapped = compute_ndvi(&band(nir), &band(red), &NdviParams::default())
        .expect("NDVI computation failed");

    // Vegetation-like inputs: NIR above red gives positive NDVI, the swap does not
    assert!(forward.ndvi.data().iter().all(|&v| v > 0.0));
    assert!(swapped.ndvi.data().iter().all(|&v| v < 0.0));
    assert_ne!(forward.ndvi.data(), swapped.ndvi.data());
}

#[test]
fn test_epsilon_is_configurable() {
    let params = NdviParams {
        epsilon: 0.1,
        ..NdviParams::default()
    };
    let product = compute_ndvi(
        &band(Array2::from_elem((1, 1), 0.1)),
        &band(Array2::from_elem((1, 1), 0.5)),
        &params,
    )
    .expect("NDVI computation failed");

    assert_abs_diff_eq!(product.ndvi.data()[[0, 0]], 0.4 / 0.7, epsilon = 1e-6);
}
