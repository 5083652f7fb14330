use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};

use rs_worddist_core::cell::{rank_cells_by_item_probability, ItemCellCache};
use rs_worddist_core::dist::{Context, PseudoGoodTuring};
use rs_worddist_core::harness::DifferentialHarness;
use rs_worddist_core::io::{build_output_path, read_lines, read_snapshot, read_stopwords, write_snapshot};
use rs_worddist_core::pipeline::{Document, Pipeline};
use rs_worddist_core::DistributionConfig;

const CORPUS_PATH: &str = "./data/synthetic.txt";
const STOPWORDS_PATH: &str = "./data/stopwords.txt";

const REGIONS: [(&str, [&str; 8]); 3] = [
    ("coast", ["sea", "port", "boat", "fish", "sand", "tide", "harbor", "gull"]),
    ("mountain", ["snow", "peak", "ski", "trail", "lodge", "glacier", "summit", "pine"]),
    ("desert", ["dune", "cactus", "heat", "oasis", "camel", "sand", "mirage", "canyon"]),
];
const COMMON: [&str; 8] = ["the", "a", "of", "and", "in", "to", "town", "road"];
const STOPWORDS: [&str; 6] = ["the", "a", "of", "and", "in", "to"];

/// Writes a small labelled corpus, one document per line:
/// `id<TAB>region<TAB>split<TAB>tokens`.
fn write_synthetic_corpus(path: &Path, seed: u64) -> std::io::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut lines = Vec::new();
    for (region, topic) in REGIONS {
        for i in 0..40 {
            let split = if i < 32 { "training" } else { "eval" };
            let len = rng.random_range(15..40);
            let tokens: Vec<&str> = (0..len)
                .filter_map(|_| if rng.random_bool(0.6) { topic.choose(&mut rng) } else { COMMON.choose(&mut rng) })
                .copied()
                .collect();
            lines.push(format!("{region}-{i}\t{region}\t{split}\t{}", tokens.join(" ")));
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, lines.join("\n"))
}

/// Parses corpus lines into documents and their region labels.
fn parse_corpus(lines: &[String]) -> (Vec<Document>, Vec<String>) {
    let mut documents = Vec::new();
    let mut regions = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if let [id, region, split, text] = fields[..] {
            documents.push(Document::new(id, text.split_whitespace(), split == "training"));
            regions.push(region.to_owned());
        }
    }
    (documents, regions)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Generate the corpus and the stopword list on first run
    let corpus_path = Path::new(CORPUS_PATH);
    if !corpus_path.exists() {
        write_synthetic_corpus(corpus_path, 42)?;
    }
    if !Path::new(STOPWORDS_PATH).exists() {
        fs::write(STOPWORDS_PATH, STOPWORDS.join("\n"))?;
    }

    let (documents, regions) = parse_corpus(&read_lines(corpus_path)?);
    let stopwords = read_stopwords(STOPWORDS_PATH)?;

    // Check slow and fast divergence against each other on random corpora
    let report = DifferentialHarness::new(7).run(20)?;
    println!(
        "Harness: {} comparisons, max |slow - fast| = {:e}, consistent = {}",
        report.comparisons,
        report.max_difference,
        report.is_consistent()
    );

    let mut config = DistributionConfig::default();
    config.consistency_check = true;
    config.set_tolerance(1e-8)?;

    let pipeline = Pipeline::new(Context::pseudo_good_turing(), config, stopwords);
    let built = pipeline.run(documents)?;

    // One cell per region, filled with its training documents
    let labels: Vec<String> = REGIONS.iter().map(|(region, _)| region.to_string()).collect();
    let region_of = |id: &str| -> Option<usize> {
        let region = id.split('-').next()?;
        labels.iter().position(|label| label == region)
    };
    let cells = pipeline.build_cells(&built, &labels, |doc| region_of(&doc.id))?;
    for cell in &cells {
        println!("Cell {}: {} documents, {} tokens", cell.label(), cell.num_docs(), cell.distribution().num_tokens());
    }

    // Rank cells for every evaluation document, with KL and per-word strategies
    let cache = ItemCellCache::default();
    let ranked = pipeline.rank_evaluation(&built, &cells)?;
    let (mut kl_correct, mut word_correct) = (0, 0);
    for (id, ranking) in &ranked {
        let expected = region_of(id);
        if ranking.first().map(|(index, _)| *index) == expected {
            kl_correct += 1;
        }
        if let Some(doc) = built.get(id) {
            let by_word = rank_cells_by_item_probability(&doc.dist, &cells, &cache)?;
            if by_word.first().map(|(index, _)| *index) == expected {
                word_correct += 1;
            }
        }
    }
    println!("Partial KL: {kl_correct}/{} evaluation documents in the right cell", ranked.len());
    println!("Per-word cell distribution: {word_correct}/{} evaluation documents in the right cell", ranked.len());

    // Most distinctive words between the first two cells
    let vocab = pipeline.context().vocab();
    for (item, score) in cells[0].distribution().dunning_comparison(cells[1].distribution(), 5) {
        println!("  {:>10}  G2 = {:.2}", vocab.unmemoize(item)?, score.g2);
    }

    // Cache the frozen aggregate next to the corpus and reload it
    let snapshot_path = build_output_path(corpus_path, "bin")?;
    write_snapshot(&snapshot_path, &pipeline.context().snapshot()?)?;
    let restored = Context::from_snapshot(read_snapshot(&snapshot_path)?, PseudoGoodTuring);

    let mut query = restored.new_distribution(false);
    query.add_items(["snow", "ski", "unheardof"])?;
    query.finish(0)?;
    for word in ["snow", "sea", "unheardof"] {
        println!("P({word}) = {:.5}", query.lookup_str(word)?);
    }

    // Querying a distribution from another context is an error
    match query.kl_divergence(cells[0].distribution(), true) {
        Ok(_) => println!("Should not happen"),
        Err(err) => println!("Expected error: {err}"),
    }

    Ok(())
}
