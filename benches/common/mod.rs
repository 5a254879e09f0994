#![allow(dead_code)]

use hetgrad::{Config, Graph, NodeId};

// ─── MLP-style layer stack ─────────────────────────────────────────────────
// y = σ(w_k · … tanh(w_1 · x + b_1) … + b_k), elementwise weights.

pub struct Stack {
    pub graph: Graph<f64>,
    pub x: NodeId,
    pub weights: Vec<NodeId>,
    pub output: NodeId,
}

pub fn layer_stack(len: usize, layers: usize) -> Stack {
    let mut graph = Graph::new(Config::default().with_accelerator_capacity(1 << 26));
    let init: Vec<f64> = (0..len).map(|i| 0.5 + 0.001 * (i % 97) as f64).collect();
    let x = graph.leaf([len], &init, false).unwrap();
    let mut weights = Vec::with_capacity(layers);
    let mut h = x;
    for k in 0..layers {
        let w = graph.leaf([len], &vec![0.9 - 0.01 * k as f64; len], true).unwrap();
        let b = graph.scalar(0.01 * k as f64);
        let wx = graph.mul(w, h).unwrap();
        let z = graph.add(wx, b).unwrap();
        h = if k + 1 == layers {
            graph.sigmoid(z).unwrap()
        } else {
            graph.tanh(z).unwrap()
        };
        weights.push(w);
    }
    Stack {
        graph,
        x,
        weights,
        output: h,
    }
}

// ─── Wide sum with shared subexpressions ───────────────────────────────────
// Σ_i (x_i + x_{i+1}) · (x_{i+1} - x_{i+2}), so each leaf has several readers.

pub fn wide_sum(terms: usize) -> (Graph<f64>, NodeId) {
    let mut graph = Graph::new(Config::default());
    let leaves: Vec<NodeId> = (0..terms + 2)
        .map(|i| graph.leaf([4], &[i as f64; 4], false).unwrap())
        .collect();
    let mut acc: Option<NodeId> = None;
    for i in 0..terms {
        let s = graph.add(leaves[i], leaves[i + 1]).unwrap();
        let d = graph.sub(leaves[i + 1], leaves[i + 2]).unwrap();
        let t = graph.mul(s, d).unwrap();
        acc = Some(match acc {
            Some(a) => graph.add(a, t).unwrap(),
            None => t,
        });
    }
    (graph, acc.unwrap())
}
