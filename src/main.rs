use std::{env, io::Cursor};

use anyhow::Context;
use log::info;
use ndarray::{array, Array2};

use replica_orchestration::{BatchList, DataBatch, DataIter, Trainer};

const ROUNDS: usize = 200;

/// Options the demo network is built from, any `name=value` argument is applied after them.
const DEFAULTS: &[(&str, &str)] = &[
    ("dev", "0-1"),
    ("batch_size", "4"),
    ("input_size", "2"),
    ("layer[fc1]", "fullc:8"),
    ("layer[]", "tanh"),
    ("layer[fc2]", "fullc:2"),
    ("loss", "softmax"),
    ("eta", "0.5"),
    ("momentum", "0.9"),
    ("seed", "7"),
    ("metric", "error"),
    ("metric", "logloss"),
];

fn xor() -> anyhow::Result<DataBatch> {
    let data = array![[0., 0.], [0., 1.], [1., 0.], [1., 1.]];
    let label: Array2<f32> = array![[0.], [1.], [1.], [0.]];
    Ok(DataBatch::new(data, label)?)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut trainer = Trainer::new();
    for (name, value) in DEFAULTS {
        trainer.set_option(name, value)?;
    }
    for arg in env::args().skip(1) {
        let (name, value) = arg
            .split_once('=')
            .with_context(|| format!("expected name=value, got '{arg}'"))?;
        trainer.set_option(name, value)?;
    }

    trainer.init_model()?;

    let batch = xor()?;
    let mut eval = BatchList::new(vec![batch.clone()]);

    for round in 0..ROUNDS {
        trainer.start_round(round)?;
        trainer.update(&batch)?;

        if (round + 1) % 50 == 0 {
            let report = trainer.evaluate(Some(&mut eval as &mut dyn DataIter), "xor")?;
            info!("[{}]{report}", round + 1);
        }
    }

    let mut saved = Vec::new();
    trainer.save_model(&mut saved)?;
    let mut restored = Trainer::new();
    for (name, value) in DEFAULTS {
        restored.set_option(name, value)?;
    }
    restored.load_model(&mut Cursor::new(saved))?;

    info!(
        "predictions after {} epochs: {}",
        restored.epoch_counter(),
        restored.predict(&batch)?
    );

    Ok(())
}
