//! Training agent: fits a small fully-connected regression network to the
//! supplied columns and returns it serialized.
//!
//! Network: ReLU hidden layers, linear output, mean squared error, plain
//! mini-batch SGD. Inputs and targets are standardized per column; the
//! scaling parameters travel with the model so predictions can be mapped
//! back.

use async_trait::async_trait;
use base64::Engine as _;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Transform;
use crate::error::TransformError;
use crate::message::Payload;
use crate::schema::{TrainRequest, TrainResponse};

#[derive(Default)]
pub struct TrainTransform {
    /// Fixed RNG seed for reproducible runs; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl TrainTransform {
    pub fn seeded(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }
}

#[async_trait]
impl Transform for TrainTransform {
    fn name(&self) -> &str {
        "train"
    }

    async fn apply(&self, payload: Payload) -> Result<Value, TransformError> {
        let Payload::Json(map) = payload else {
            return Err(TransformError::invalid("train expects a JSON payload"));
        };
        let request: TrainRequest = serde_json::from_value(Value::Object(map))?;
        validate(&request)?;

        let seed = self.seed;
        let response = tokio::task::spawn_blocking(move || fit(request, seed))
            .await
            .map_err(|e| TransformError::failed(format!("training aborted: {}", e)))??;

        serde_json::to_value(response).map_err(|e| TransformError::failed(e.to_string()))
    }
}

fn validate(request: &TrainRequest) -> Result<(), TransformError> {
    if request.batch_size == 0 {
        return Err(TransformError::invalid("batch_size must be at least 1"));
    }
    if !(request.lr.is_finite() && request.lr > 0.0) {
        return Err(TransformError::invalid("lr must be a positive number"));
    }
    if request.hidden_layers.iter().any(|&n| n == 0) {
        return Err(TransformError::invalid("hidden layer sizes must be positive"));
    }
    Ok(())
}

fn fit(request: TrainRequest, seed: Option<u64>) -> Result<TrainResponse, TransformError> {
    let (input_names, inputs) = columns_to_rows(&request.input_data, "input_data")?;
    let (output_names, targets) = columns_to_rows(&request.output_data, "output_data")?;
    if inputs.len() != targets.len() {
        return Err(TransformError::invalid(format!(
            "input_data has {} samples but output_data has {}",
            inputs.len(),
            targets.len()
        )));
    }

    let input_scaler = Scaler::fit(&inputs);
    let output_scaler = Scaler::fit(&targets);
    let x: Vec<Vec<f64>> = inputs.iter().map(|r| input_scaler.apply(r)).collect();
    let y: Vec<Vec<f64>> = targets.iter().map(|r| output_scaler.apply(r)).collect();

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut sizes = vec![input_names.len()];
    sizes.extend_from_slice(&request.hidden_layers);
    sizes.push(output_names.len());
    let mut network = Network::new(&sizes, &mut rng);

    let mut order: Vec<usize> = (0..x.len()).collect();
    for epoch in 0..request.epochs {
        order.shuffle(&mut rng);
        for batch in order.chunks(request.batch_size) {
            network.step(batch.iter().map(|&i| (&x[i][..], &y[i][..])), request.lr);
        }
        if (epoch + 1) % 10 == 0 || epoch + 1 == request.epochs {
            tracing::debug!(
                "[Worker:train] Epoch {}/{} | loss {:.4}",
                epoch + 1,
                request.epochs,
                network.loss(&x, &y)
            );
        }
    }

    let loss = network.loss(&x, &y);
    if !loss.is_finite() {
        return Err(TransformError::failed("training diverged; try a smaller lr"));
    }
    tracing::info!(
        "[Worker:train] Trained {:?} on {} samples, final loss {:.4}",
        sizes,
        x.len(),
        loss
    );

    let model = SerializedModel {
        input_names,
        output_names,
        input_scaler,
        output_scaler,
        layers: network.layers,
    };
    let model_json =
        serde_json::to_vec(&model).map_err(|e| TransformError::failed(e.to_string()))?;

    Ok(TrainResponse {
        input_data: request.input_data,
        output_data: request.output_data,
        hidden_layers: request.hidden_layers,
        epochs: request.epochs,
        lr: request.lr,
        batch_size: request.batch_size,
        model: base64::engine::general_purpose::STANDARD.encode(model_json),
        loss,
    })
}

/// Turn `{name: [v0, v1, ...]}` columns into per-sample rows.
fn columns_to_rows(
    columns: &Map<String, Value>,
    field: &str,
) -> Result<(Vec<String>, Vec<Vec<f64>>), TransformError> {
    if columns.is_empty() {
        return Err(TransformError::invalid(format!("{} has no columns", field)));
    }

    let mut names = Vec::with_capacity(columns.len());
    let mut values: Vec<Vec<f64>> = Vec::with_capacity(columns.len());
    for (name, column) in columns {
        let cells = column
            .as_array()
            .ok_or_else(|| TransformError::invalid(format!("{}.{} is not a list", field, name)))?;
        let parsed = cells
            .iter()
            .map(|v| v.as_f64())
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| {
                TransformError::invalid(format!("{}.{} contains non-numeric values", field, name))
            })?;
        names.push(name.clone());
        values.push(parsed);
    }

    let samples = values[0].len();
    if samples == 0 {
        return Err(TransformError::invalid(format!("{} has no samples", field)));
    }
    if values.iter().any(|c| c.len() != samples) {
        return Err(TransformError::invalid(format!(
            "{} columns have different lengths",
            field
        )));
    }

    let rows = (0..samples)
        .map(|i| values.iter().map(|c| c[i]).collect())
        .collect();
    Ok((names, rows))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Scaler {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl Scaler {
    fn fit(rows: &[Vec<f64>]) -> Self {
        let n = rows.len() as f64;
        let width = rows.first().map_or(0, Vec::len);
        let mut mean = vec![0.0; width];
        for row in rows {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v / n;
            }
        }
        let mut std = vec![0.0; width];
        for row in rows {
            for ((s, v), m) in std.iter_mut().zip(row).zip(&mean) {
                *s += (v - m).powi(2) / n;
            }
        }
        for s in std.iter_mut() {
            *s = if *s > 0.0 { s.sqrt() } else { 1.0 };
        }
        Self { mean, std }
    }

    fn apply(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Dense {
    /// `weights[out][in]`
    weights: Vec<Vec<f64>>,
    biases: Vec<f64>,
}

struct Network {
    layers: Vec<Dense>,
}

impl Network {
    /// He-uniform initialisation.
    fn new(sizes: &[usize], rng: &mut StdRng) -> Self {
        let layers = sizes
            .windows(2)
            .map(|pair| {
                let (fan_in, fan_out) = (pair[0], pair[1]);
                let limit = (6.0 / fan_in.max(1) as f64).sqrt();
                Dense {
                    weights: (0..fan_out)
                        .map(|_| (0..fan_in).map(|_| rng.gen_range(-limit..limit)).collect())
                        .collect(),
                    biases: vec![0.0; fan_out],
                }
            })
            .collect();
        Self { layers }
    }

    /// Post-activation outputs of every layer, input first.
    fn forward(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let last = self.layers.len() - 1;
        let mut acts = Vec::with_capacity(self.layers.len() + 1);
        acts.push(x.to_vec());
        for (i, layer) in self.layers.iter().enumerate() {
            let prev = &acts[i];
            let out: Vec<f64> = layer
                .weights
                .iter()
                .zip(&layer.biases)
                .map(|(row, b)| {
                    let z = row.iter().zip(prev).map(|(w, a)| w * a).sum::<f64>() + b;
                    if i < last {
                        z.max(0.0)
                    } else {
                        z
                    }
                })
                .collect();
            acts.push(out);
        }
        acts
    }

    fn loss(&self, x: &[Vec<f64>], y: &[Vec<f64>]) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for (xi, yi) in x.iter().zip(y) {
            let acts = self.forward(xi);
            let out = &acts[acts.len() - 1];
            for (o, t) in out.iter().zip(yi) {
                total += (o - t).powi(2);
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }

    /// One SGD update averaged over the batch.
    fn step<'a>(&mut self, batch: impl Iterator<Item = (&'a [f64], &'a [f64])>, lr: f64) {
        let mut grad_w: Vec<Vec<Vec<f64>>> = self
            .layers
            .iter()
            .map(|l| l.weights.iter().map(|r| vec![0.0; r.len()]).collect())
            .collect();
        let mut grad_b: Vec<Vec<f64>> = self.layers.iter().map(|l| vec![0.0; l.biases.len()]).collect();
        let mut n = 0usize;

        for (x, y) in batch {
            n += 1;
            let acts = self.forward(x);
            let out = &acts[acts.len() - 1];
            let dim = out.len() as f64;
            let mut delta: Vec<f64> = out.iter().zip(y).map(|(o, t)| 2.0 * (o - t) / dim).collect();

            for l in (0..self.layers.len()).rev() {
                let input = &acts[l];
                for (j, d) in delta.iter().enumerate() {
                    grad_b[l][j] += d;
                    for (k, a) in input.iter().enumerate() {
                        grad_w[l][j][k] += d * a;
                    }
                }
                if l > 0 {
                    let weights = &self.layers[l].weights;
                    delta = (0..input.len())
                        .map(|k| {
                            if input[k] <= 0.0 {
                                return 0.0;
                            }
                            weights.iter().zip(&delta).map(|(row, d)| row[k] * d).sum::<f64>()
                        })
                        .collect();
                }
            }
        }

        if n == 0 {
            return;
        }
        let scale = lr / n as f64;
        for (layer, (gw, gb)) in self.layers.iter_mut().zip(grad_w.iter().zip(&grad_b)) {
            for (row, grow) in layer.weights.iter_mut().zip(gw) {
                for (w, g) in row.iter_mut().zip(grow) {
                    *w -= scale * g;
                }
            }
            for (b, g) in layer.biases.iter_mut().zip(gb) {
                *b -= scale * g;
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SerializedModel {
    input_names: Vec<String>,
    output_names: Vec<String>,
    input_scaler: Scaler,
    output_scaler: Scaler,
    layers: Vec<Dense>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_dataset(epochs: usize) -> Map<String, Value> {
        let x1: Vec<f64> = (0..120).map(|i| i as f64 / 120.0).collect();
        let x2: Vec<f64> = (0..120).map(|i| ((i * 37) % 120) as f64 / 120.0).collect();
        let y: Vec<f64> = x1.iter().zip(&x2).map(|(a, b)| 2.0 * a + 3.0 * b).collect();
        json!({
            "input_data": {"feature1": x1, "feature2": x2},
            "output_data": {"target": y},
            "hidden_layers": [8],
            "epochs": epochs,
            "batch_size": 8
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[tokio::test]
    async fn test_training_reduces_loss_and_echoes_fields() {
        let untrained = TrainTransform::seeded(7)
            .apply(Payload::Json(linear_dataset(0)))
            .await
            .unwrap();
        let trained = TrainTransform::seeded(7)
            .apply(Payload::Json(linear_dataset(150)))
            .await
            .unwrap();

        let before = untrained["loss"].as_f64().unwrap();
        let after = trained["loss"].as_f64().unwrap();
        assert!(after < before * 0.5, "loss {} did not drop from {}", after, before);

        assert_eq!(trained["hidden_layers"], json!([8]));
        assert_eq!(trained["batch_size"], json!(8));
        assert!((trained["lr"].as_f64().unwrap() - 0.01).abs() < 1e-12);

        let blob = base64::engine::general_purpose::STANDARD
            .decode(trained["model"].as_str().unwrap())
            .unwrap();
        let model: SerializedModel = serde_json::from_slice(&blob).unwrap();
        assert_eq!(model.layers.len(), 2);
        assert_eq!(model.output_names, vec!["target".to_string()]);
    }

    #[tokio::test]
    async fn test_mismatched_sample_counts_are_invalid() {
        let map = json!({
            "input_data": {"x": [1, 2, 3]},
            "output_data": {"y": [1, 2]}
        });
        let err = TrainTransform::default()
            .apply(Payload::Json(map.as_object().cloned().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidInput(_)));
    }

    #[test]
    fn test_scaler_handles_constant_column() {
        let scaler = Scaler::fit(&[vec![5.0, 1.0], vec![5.0, 3.0]]);
        assert_eq!(scaler.std[0], 1.0);
        assert_eq!(scaler.apply(&[5.0, 3.0]), vec![0.0, 1.0]);
    }
}
