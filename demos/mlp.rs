use lib_gradgen::graph::{Graph, InitKind};
use lib_gradgen::{Generator, GradError, Mode, Seed, TrainingConfig};

fn main() -> Result<(), GradError> {
  // A two layer classifier: input -> fc -> relu -> fc -> softmax -> save
  let mut graph = Graph::new();
  let input = graph.create_variable("input", &[8, 32], InitKind::Extern, false);
  let selected = graph.create_variable("selected", &[8, 1], InitKind::Extern, false);

  let hidden = graph.create_fully_connected("fc1", input, 16)?;
  let hidden = graph.create_relu("relu1", hidden)?;
  let logits = graph.create_fully_connected("fc2", hidden, 10)?;
  let probs = graph.create_softmax("softmax", logits, selected)?;
  graph.create_save("result", probs)?;

  let forward = graph.len();
  println!("forward graph:\n{graph}");

  let config = TrainingConfig {
    learning_rate: 0.05,
    momentum: 0.9,
    batch_size: 8,
    ..Default::default()
  };
  let out = Generator::new(&config, Mode::TrainDebug)
    .with_seed(Seed::Splat(1.0))
    .generate(&mut graph)?;

  println!("backward graph:");
  for id in out.node_ids() {
    let node = &graph[id];
    println!("{id} {} = {}({:?})", node.name(), node.kind(), node.inputs());
  }

  println!(
    "{forward} forward nodes, {} appended, {} updates",
    out.len(),
    out.updates.len()
  );
  for (var, holder) in &out.gradient_vars {
    println!("gradient of `{}` lands in `{}`", graph[*var].name(), graph[*holder].name());
  }
  Ok(())
}
