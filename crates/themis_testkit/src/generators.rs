//! Seeded random entity generators.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use themis_codec::{Entity, Value};

/// One generated entity with the raw inputs that built it.
#[derive(Debug, Clone)]
pub struct GeneratedEntity {
    /// The entity.
    pub entity: Entity,
    /// The embedding written to the `emb` field, if any.
    pub embedding: Option<Vec<f32>>,
}

/// Deterministic generator over a seed.
pub struct DataGenerator {
    rng: StdRng,
}

impl DataGenerator {
    /// Creates a generator for a seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A random lowercase identifier of the given length.
    pub fn ident(&mut self, len: usize) -> String {
        (0..len)
            .map(|_| char::from(b'a' + self.rng.gen_range(0..26)))
            .collect()
    }

    /// A normalized random embedding.
    pub fn embedding(&mut self, dim: usize) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim).map(|_| self.rng.gen_range(-1.0..1.0)).collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    /// A random coordinate inside the given box.
    pub fn coordinate(&mut self, min: (f64, f64), max: (f64, f64)) -> (f64, f64) {
        (
            self.rng.gen_range(min.0..max.0),
            self.rng.gen_range(min.1..max.1),
        )
    }

    /// A batch of entities in `table` with scalar fields and an optional
    /// embedding.
    pub fn entities(
        &mut self,
        table: &str,
        count: usize,
        embedding_dim: Option<usize>,
    ) -> Vec<GeneratedEntity> {
        (0..count)
            .map(|n| {
                let mut entity = Entity::new(format!("{table}:{table}{n}"));
                entity.set_field("name", Value::Str(self.ident(8)));
                entity.set_field("rank", Value::Int(self.rng.gen_range(0..1000)));
                entity.set_field("score", Value::Float(self.rng.gen_range(0.0..1.0)));
                let embedding = embedding_dim.map(|dim| {
                    let v = self.embedding(dim);
                    entity.set_field("emb", Value::FloatVec(v.clone()));
                    v
                });
                GeneratedEntity { entity, embedding }
            })
            .collect()
    }
}
