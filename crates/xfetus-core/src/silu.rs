use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// SiLU (Sigmoid Linear Unit) activation: x * sigmoid(x)
pub fn silu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * sigmoid(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_silu_zero_is_zero() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 2.0], &device);
        let y: Vec<f32> = silu(x).into_data().to_vec().unwrap();
        assert_eq!(y[0], 0.0);
        // 2 * sigmoid(2) = 1.7616
        assert!((y[1] - 1.7616).abs() < 1e-3);
    }
}
