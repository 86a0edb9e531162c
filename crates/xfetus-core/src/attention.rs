use burn::prelude::*;

/// Scaled dot-product attention
///
/// Inputs are `[batch, heads, seq, head_dim]`. Query and key are each scaled
/// by `head_dim^-0.25`, giving the usual `1/sqrt(head_dim)` on the logits.
pub fn scaled_dot_product_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let [_batch, _heads, _seq_len, head_dim] = q.dims();
    let scale = (head_dim as f64).powf(-0.25);

    let q = q * scale;
    let k = k * scale;

    // [batch, heads, seq_q, seq_k]
    let attn = q.matmul(k.transpose());
    let attn = burn::tensor::activation::softmax(attn, 3);

    attn.matmul(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_attention_shape() {
        let device = Default::default();
        let q = Tensor::<TestBackend, 4>::ones([2, 1, 16, 8], &device);
        let out = scaled_dot_product_attention(q.clone(), q.clone(), q);
        assert_eq!(out.dims(), [2, 1, 16, 8]);
    }

    #[test]
    fn test_uniform_keys_average_values() {
        let device = Default::default();
        // Identical keys give uniform weights, so the output is the mean of v
        let q = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let k = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let v = Tensor::<TestBackend, 1>::from_floats([0.0, 0.0, 2.0, 4.0], &device)
            .reshape([1, 1, 2, 2]);

        let out: Vec<f32> = scaled_dot_product_attention(q, k, v)
            .into_data()
            .to_vec()
            .unwrap();
        assert!((out[0] - 1.0).abs() < 1e-5);
        assert!((out[1] - 2.0).abs() < 1e-5);
    }
}
